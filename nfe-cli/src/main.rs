use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Parser, Subcommand};
use nfe_core::access_key::{AccessKey, AccessKeyParts, random_code};
use nfe_core::api::SefazConnector;
use nfe_core::certificate::{BundleKey, BundleLocation, CertificateManager};
use nfe_core::config::{Config, ENV_BUNDLE_KEY, Region};
use nfe_core::document::sign::DocumentSigner;
use nfe_core::document::xml::ToXml;
use nfe_core::document::{DocumentBuilder, EMISSION_NORMAL, FiscalProfile, InvoiceDraft};
use nfe_core::engine::{FiscalEngine, SubmitOptions};
use nfe_core::memory::{InMemoryRecordStore, InMemorySeriesCounter, StaticProfileStore};
use nfe_core::ports::TenantId;
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_TENANT: &str = "cli";

#[derive(Parser)]
#[command(name = "nfe")]
#[command(about = "NF-e (model 55) operator CLI")]
struct Cli {
    /// Base64 key protecting certificate bundles at rest.
    #[arg(long, global = true, env = ENV_BUNDLE_KEY, hide_env_values = true)]
    bundle_key: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh bundle key.
    GenerateKey,
    /// Compose an access key and its check digit.
    AccessKey {
        #[arg(long)]
        region: Region,
        #[arg(long)]
        year: u8,
        #[arg(long)]
        month: u8,
        #[arg(long)]
        cnpj: String,
        #[arg(long, default_value_t = 1)]
        series: u16,
        #[arg(long)]
        number: u32,
        #[arg(long)]
        random_code: Option<u32>,
    },
    /// Check an access key and print its components.
    VerifyKey { key: String },
    /// Encrypt a PKCS#12 file into an at-rest bundle.
    EncryptBundle {
        #[arg(long)]
        pfx: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Decrypt a bundle and report certificate validity.
    InspectCert {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        password: String,
    },
    /// Build the unsigned document XML from a profile and a draft.
    Build {
        #[command(flatten)]
        document: DocumentArgs,
        #[arg(long)]
        pretty: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Build and sign with the profile's certificate.
    Sign {
        #[command(flatten)]
        document: DocumentArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Submit a draft for authorization, numbering from `--number`.
    Submit {
        #[command(flatten)]
        document: DocumentArgs,
        /// Ask for asynchronous processing and poll the receipt.
        #[arg(long = "async")]
        asynchronous: bool,
        /// Where to write the distributable `nfeProc` once authorized.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Ask the authority for a document's situation.
    Query {
        #[arg(long)]
        profile: PathBuf,
        #[arg(long)]
        key: String,
    },
    /// Check whether the profile's authorizer is available.
    ServiceStatus {
        #[arg(long)]
        profile: PathBuf,
    },
}

#[derive(clap::Args)]
struct DocumentArgs {
    /// Fiscal profile JSON.
    #[arg(long)]
    profile: PathBuf,
    /// Invoice draft JSON.
    #[arg(long)]
    draft: PathBuf,
    #[arg(long)]
    number: u32,
    /// Emission time (RFC 3339); Brasília now when absent.
    #[arg(long)]
    issued_at: Option<DateTime<FixedOffset>>,
    #[arg(long)]
    random_code: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateKey => {
            println!("{}", BundleKey::generate()?.to_base64());
        }
        Commands::AccessKey {
            region,
            year,
            month,
            cnpj,
            series,
            number,
            random_code: code,
        } => {
            let key = AccessKey::generate(&AccessKeyParts {
                region,
                year,
                month,
                cnpj,
                model: 55,
                series,
                number,
                emission_type: EMISSION_NORMAL,
                random_code: code.unwrap_or_else(|| random_code(&mut rand::thread_rng())),
            })?;
            println!("{key}");
        }
        Commands::VerifyKey { key } => {
            let key = AccessKey::parse(&key)?;
            println!("region: {}", key.region());
            println!("year/month: {:02}/{:02}", key.year(), key.month());
            println!("cnpj: {}", key.cnpj());
            println!("model: {}", key.model());
            println!("series: {}", key.series());
            println!("number: {}", key.number());
            println!("emission type: {}", key.emission_type());
            println!("check digit: {}", key.check_digit());
        }
        Commands::EncryptBundle { pfx, output } => {
            let key = bundle_key(cli.bundle_key.as_deref())?;
            let der = std::fs::read(&pfx)
                .with_context(|| format!("failed to read {}", pfx.display()))?;
            let blob = key.encrypt(&der)?;
            write_or_print(output.as_deref(), &blob)?;
        }
        Commands::InspectCert { bundle, password } => {
            let key = bundle_key(cli.bundle_key.as_deref())?;
            let material = CertificateManager::new(&key)
                .load_certificate(&BundleLocation::File(bundle), &password)?;
            let validation = CertificateManager::validate(&material, Utc::now());
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if !validation.valid {
                bail!("certificate is outside its validity window");
            }
        }
        Commands::Build {
            document,
            pretty,
            output,
        } => {
            let profile: FiscalProfile = read_json(&document.profile)?;
            let draft: InvoiceDraft = read_json(&document.draft)?;
            let built = builder(&profile, &draft, &document).build()?;
            let xml = if pretty {
                built.to_xml_pretty()?
            } else {
                built.to_xml()?
            };
            info!(access_key = %built.access_key(), "document built");
            write_or_print(output.as_deref(), &xml)?;
        }
        Commands::Sign { document, output } => {
            let key = bundle_key(cli.bundle_key.as_deref())?;
            let profile: FiscalProfile = read_json(&document.profile)?;
            let draft: InvoiceDraft = read_json(&document.draft)?;
            let material = CertificateManager::new(&key).load(profile.certificate())?;
            material.ensure_usable(Utc::now(), &digits(profile.cnpj()))?;
            let built = builder(&profile, &draft, &document).build()?;
            let signed = DocumentSigner::new(&material).sign_document(&built)?;
            info!(access_key = %signed.access_key(), "document signed");
            write_or_print(output.as_deref(), &signed.to_file_string())?;
        }
        Commands::Submit {
            document,
            asynchronous,
            output,
        } => {
            let profile: FiscalProfile = read_json(&document.profile)?;
            let draft: InvoiceDraft = read_json(&document.draft)?;
            let series = Arc::new(InMemorySeriesCounter::new());
            series.open_series(
                &digits(profile.cnpj()),
                draft.series.unwrap_or(profile.default_series()),
                draft.kind,
                document.number,
            )?;
            let records = Arc::new(InMemoryRecordStore::new());
            let engine = engine(cli.bundle_key.as_deref(), profile, series, records.clone())?;
            let options = SubmitOptions {
                issued_at: document.issued_at,
                synchronous: !asynchronous,
                random_code: document.random_code,
            };
            let result = engine
                .submit_invoice(&TenantId::new(CLI_TENANT), &draft, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(path) = output {
                let distribution = records
                    .documents()
                    .into_iter()
                    .find_map(|record| record.distribution_xml);
                match distribution {
                    Some(xml) => write_or_print(Some(&path), &xml)?,
                    None => bail!("document was not authorized; nothing written"),
                }
            }
        }
        Commands::Query { profile, key } => {
            let profile: FiscalProfile = read_json(&profile)?;
            let key = AccessKey::parse(&key)?;
            let engine = engine(
                cli.bundle_key.as_deref(),
                profile,
                Arc::new(InMemorySeriesCounter::new()),
                Arc::new(InMemoryRecordStore::new()),
            )?;
            let result = engine.query_status(&TenantId::new(CLI_TENANT), &key).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::ServiceStatus { profile } => {
            let profile: FiscalProfile = read_json(&profile)?;
            let engine = engine(
                cli.bundle_key.as_deref(),
                profile,
                Arc::new(InMemorySeriesCounter::new()),
                Arc::new(InMemoryRecordStore::new()),
            )?;
            let status = engine.service_status(&TenantId::new(CLI_TENANT)).await?;
            println!("{} ({:?})", status.status(), status.outcome());
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn bundle_key(encoded: Option<&str>) -> Result<BundleKey> {
    let Some(encoded) = encoded else {
        bail!("no bundle key: pass --bundle-key or set {ENV_BUNDLE_KEY}");
    };
    Ok(BundleKey::from_base64(encoded)?)
}

fn engine(
    encoded_key: Option<&str>,
    profile: FiscalProfile,
    series: Arc<InMemorySeriesCounter>,
    records: Arc<InMemoryRecordStore>,
) -> Result<FiscalEngine> {
    let config = Config::from_env()?.with_bundle_key(bundle_key(encoded_key)?);
    let connector = SefazConnector::from_config(&config);
    let profiles = StaticProfileStore::new().with_profile(TenantId::new(CLI_TENANT), profile);
    Ok(FiscalEngine::new(
        config,
        Arc::new(profiles),
        series,
        records,
        Arc::new(connector),
    ))
}

fn builder<'a>(
    profile: &'a FiscalProfile,
    draft: &'a InvoiceDraft,
    args: &DocumentArgs,
) -> DocumentBuilder<'a> {
    let series = draft.series.unwrap_or(profile.default_series());
    let mut builder = DocumentBuilder::new(profile, draft, series, args.number);
    if let Some(issued_at) = args.issued_at {
        builder = builder.issued_at(issued_at);
    }
    if let Some(code) = args.random_code {
        builder = builder.random_code(code);
    }
    builder
}

fn digits(input: &str) -> String {
    input.chars().filter(char::is_ascii_digit).collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn write_or_print(path: Option<&Path>, contents: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}
