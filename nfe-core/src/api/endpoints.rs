//! Authority web service addresses, looked up by `(Environment, Region)`.
use std::collections::HashMap;

use super::TransportError;
use crate::config::{Environment, Region};

const WSDL_BASE: &str = "http://www.portalfiscal.inf.br/nfe/wsdl";

/// Web services offered by every authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Authorization,
    ReceiptQuery,
    ProtocolQuery,
    ServiceStatus,
    VoidRange,
    Events,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::Authorization,
        Service::ReceiptQuery,
        Service::ProtocolQuery,
        Service::ServiceStatus,
        Service::VoidRange,
        Service::Events,
    ];

    fn wsdl_name(&self) -> &'static str {
        match self {
            Service::Authorization => "NFeAutorizacao4",
            Service::ReceiptQuery => "NFeRetAutorizacao4",
            Service::ProtocolQuery => "NFeConsultaProtocolo4",
            Service::ServiceStatus => "NFeStatusServico4",
            Service::VoidRange => "NFeInutilizacao4",
            Service::Events => "NFeRecepcaoEvento4",
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Service::Authorization => "nfeAutorizacaoLote",
            Service::ReceiptQuery => "nfeRetAutorizacaoLote",
            Service::ProtocolQuery => "nfeConsultaNF",
            Service::ServiceStatus => "nfeStatusServicoNF",
            Service::VoidRange => "nfeInutilizacaoNF",
            Service::Events => "nfeRecepcaoEvento",
        }
    }

    /// Namespace of the `nfeDadosMsg` element.
    pub fn wsdl_namespace(&self) -> String {
        format!("{WSDL_BASE}/{}", self.wsdl_name())
    }

    /// SOAP 1.2 `action` parameter of the content type.
    pub fn soap_action(&self) -> String {
        format!("{WSDL_BASE}/{}/{}", self.wsdl_name(), self.operation())
    }

    /// Path used when every service hangs off one base URL.
    pub fn default_path(&self) -> &'static str {
        self.wsdl_name()
    }
}

/// Full URLs of one authorizer in one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    pub authorization: String,
    pub receipt_query: String,
    pub protocol_query: String,
    pub service_status: String,
    pub void_range: String,
    pub events: String,
}

impl EndpointSet {
    pub fn url(&self, service: Service) -> &str {
        match service {
            Service::Authorization => &self.authorization,
            Service::ReceiptQuery => &self.receipt_query,
            Service::ProtocolQuery => &self.protocol_query,
            Service::ServiceStatus => &self.service_status,
            Service::VoidRange => &self.void_range,
            Service::Events => &self.events,
        }
    }

    /// Every service at `{base_url}/{default_path}`.
    pub fn uniform(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::from_paths(base, &Service::ALL.map(|service| service.default_path()))
    }

    fn from_paths(host: &str, paths: &[&str; 6]) -> Self {
        let url = |path: &str| format!("{host}/{}", path.trim_start_matches('/'));
        Self {
            authorization: url(paths[0]),
            receipt_query: url(paths[1]),
            protocol_query: url(paths[2]),
            service_status: url(paths[3]),
            void_range: url(paths[4]),
            events: url(paths[5]),
        }
    }
}

/// Endpoint sets keyed by environment and region.
///
/// # Examples
/// ```rust
/// use nfe_core::api::endpoints::{EndpointTable, Service};
/// use nfe_core::config::{Environment, Region};
///
/// let table = EndpointTable::sefaz();
/// let set = table.lookup(Environment::Homologation, Region::SC)?;
/// assert!(set.url(Service::Authorization).starts_with("https://nfe-homologacao.svrs.rs.gov.br/"));
/// # Ok::<(), nfe_core::api::TransportError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    entries: HashMap<(Environment, Region), EndpointSet>,
}

impl EndpointTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in production and homologation addresses.
    pub fn sefaz() -> Self {
        let mut table = Self::empty();
        for (authorizer, regions) in AUTHORIZERS {
            for &region in *regions {
                table.insert(
                    Environment::Production,
                    region,
                    EndpointSet::from_paths(authorizer.production, &authorizer.paths),
                );
                table.insert(
                    Environment::Homologation,
                    region,
                    EndpointSet::from_paths(authorizer.homologation, &authorizer.paths),
                );
            }
        }
        table
    }

    /// Every environment and region routed to one base URL.
    pub fn uniform(base_url: &str) -> Self {
        let set = EndpointSet::uniform(base_url);
        let mut table = Self::empty();
        for environment in [Environment::Production, Environment::Homologation] {
            for &region in Region::ALL {
                table.insert(environment, region, set.clone());
            }
        }
        table
    }

    pub fn insert(&mut self, environment: Environment, region: Region, set: EndpointSet) -> &mut Self {
        self.entries.insert((environment, region), set);
        self
    }

    /// # Errors
    /// Returns [`TransportError::UnsupportedRegion`] for an unconfigured pair.
    pub fn lookup(&self, environment: Environment, region: Region) -> Result<&EndpointSet, TransportError> {
        self.entries
            .get(&(environment, region))
            .ok_or(TransportError::UnsupportedRegion {
                environment,
                region,
            })
    }
}

struct Authorizer {
    production: &'static str,
    homologation: &'static str,
    paths: [&'static str; 6],
}

const SVRS_PATHS: [&str; 6] = [
    "ws/NfeAutorizacao/NFeAutorizacao4.asmx",
    "ws/NfeRetAutorizacao/NFeRetAutorizacao4.asmx",
    "ws/NfeConsulta/NfeConsulta4.asmx",
    "ws/NfeStatusServico/NfeStatusServico4.asmx",
    "ws/nfeinutilizacao/nfeinutilizacao4.asmx",
    "ws/recepcaoevento/recepcaoevento4.asmx",
];

const SP: Authorizer = Authorizer {
    production: "https://nfe.fazenda.sp.gov.br",
    homologation: "https://homologacao.nfe.fazenda.sp.gov.br",
    paths: [
        "ws/nfeautorizacao4.asmx",
        "ws/nferetautorizacao4.asmx",
        "ws/nfeconsultaprotocolo4.asmx",
        "ws/nfestatusservico4.asmx",
        "ws/nfeinutilizacao4.asmx",
        "ws/nferecepcaoevento4.asmx",
    ],
};

const MG: Authorizer = Authorizer {
    production: "https://nfe.fazenda.mg.gov.br",
    homologation: "https://hnfe.fazenda.mg.gov.br",
    paths: [
        "nfe2/services/NFeAutorizacao4",
        "nfe2/services/NFeRetAutorizacao4",
        "nfe2/services/NFeConsultaProtocolo4",
        "nfe2/services/NFeStatusServico4",
        "nfe2/services/NFeInutilizacao4",
        "nfe2/services/NFeRecepcaoEvento4",
    ],
};

const PR: Authorizer = Authorizer {
    production: "https://nfe.sefa.pr.gov.br",
    homologation: "https://homologacao.nfe.sefa.pr.gov.br",
    paths: [
        "nfe/NFeAutorizacao4",
        "nfe/NFeRetAutorizacao4",
        "nfe/NFeConsultaProtocolo4",
        "nfe/NFeStatusServico4",
        "nfe/NFeInutilizacao4",
        "nfe/NFeRecepcaoEvento4",
    ],
};

const RS: Authorizer = Authorizer {
    production: "https://nfe.sefazrs.rs.gov.br",
    homologation: "https://nfe-homologacao.sefazrs.rs.gov.br",
    paths: SVRS_PATHS,
};

// Virtual authorizer serving states without their own infrastructure.
const SVRS: Authorizer = Authorizer {
    production: "https://nfe.svrs.rs.gov.br",
    homologation: "https://nfe-homologacao.svrs.rs.gov.br",
    paths: SVRS_PATHS,
};

const AUTHORIZERS: &[(Authorizer, &[Region])] = &[
    (SP, &[Region::SP]),
    (MG, &[Region::MG]),
    (PR, &[Region::PR]),
    (RS, &[Region::RS]),
    (
        SVRS,
        &[
            Region::AC,
            Region::AL,
            Region::AP,
            Region::DF,
            Region::ES,
            Region::PB,
            Region::PI,
            Region::RJ,
            Region::RN,
            Region::RO,
            Region::RR,
            Region::SC,
            Region::SE,
            Region::TO,
        ],
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_own_and_virtual_authorizers() {
        let table = EndpointTable::sefaz();
        let sp = table.lookup(Environment::Production, Region::SP).unwrap();
        assert_eq!(
            sp.url(Service::Authorization),
            "https://nfe.fazenda.sp.gov.br/ws/nfeautorizacao4.asmx"
        );
        let rj = table.lookup(Environment::Production, Region::RJ).unwrap();
        assert_eq!(
            rj.url(Service::Events),
            "https://nfe.svrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx"
        );
        let mg = table.lookup(Environment::Homologation, Region::MG).unwrap();
        assert_eq!(
            mg.url(Service::ServiceStatus),
            "https://hnfe.fazenda.mg.gov.br/nfe2/services/NFeStatusServico4"
        );
    }

    #[test]
    fn unconfigured_pair_is_a_hard_error() {
        let table = EndpointTable::sefaz();
        let err = table.lookup(Environment::Production, Region::BA).unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnsupportedRegion {
                environment: Environment::Production,
                region: Region::BA
            }
        ));
        assert!(EndpointTable::empty().lookup(Environment::Homologation, Region::SP).is_err());
    }

    #[test]
    fn uniform_table_routes_everything_to_one_host() {
        let table = EndpointTable::uniform("http://127.0.0.1:8080/");
        for &region in Region::ALL {
            let set = table.lookup(Environment::Homologation, region).unwrap();
            assert_eq!(set.url(Service::ReceiptQuery), "http://127.0.0.1:8080/NFeRetAutorizacao4");
        }
    }

    #[test]
    fn soap_metadata_follows_wsdl_names() {
        assert_eq!(
            Service::Authorization.wsdl_namespace(),
            "http://www.portalfiscal.inf.br/nfe/wsdl/NFeAutorizacao4"
        );
        assert_eq!(
            Service::Events.soap_action(),
            "http://www.portalfiscal.inf.br/nfe/wsdl/NFeRecepcaoEvento4/nfeRecepcaoEvento"
        );
    }
}
