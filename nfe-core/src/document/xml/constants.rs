pub(crate) const NFE_NS: &str = "http://www.portalfiscal.inf.br/nfe";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub(crate) const NFE_VERSION: &str = "4.00";
pub(crate) const EVENT_VERSION: &str = "1.00";
pub(crate) const APP_VERSION: &str = concat!("nfe-rs ", env!("CARGO_PKG_VERSION"));

pub(crate) const SIGNED_INFO_TEMPLATE: &str =
    include_str!("../../../assets/templates/signed_info.xml");
pub(crate) const SIGNATURE_TEMPLATE: &str =
    include_str!("../../../assets/templates/signature.xml");

/// Fixed usage conditions every correction letter must carry.
pub(crate) const CORRECTION_CONDITIONS: &str = "A Carta de Correcao e disciplinada pelo \
paragrafo 1o-A do art. 7o do Convenio S/N, de 15 de dezembro de 1970 e pode ser utilizada \
para regularizacao de erro ocorrido na emissao de documento fiscal, desde que o erro nao \
esteja relacionado com: I - as variaveis que determinam o valor do imposto tais como: base \
de calculo, aliquota, diferenca de preco, quantidade, valor da operacao ou da prestacao; \
II - a correcao de dados cadastrais que implique mudanca do remetente ou do destinatario; \
III - a data de emissao ou de saida.";
