use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::{BusConfig, ConnectionConfig, ConsumerConfig, PublisherConfig, TlsConfig};

/// Builds a [`BusConfig`] from `BUS_*` environment variables, reading a
/// `.env` file first when one is present.
///
/// Required: `BUS_CLIENT_NAME`, `BUS_HOST`, `BUS_USER`, `BUS_PASSWORD`.
pub fn load_from_env() -> Result<BusConfig> {
    dotenv().ok();

    let mut connection = ConnectionConfig::new(
        &required("BUS_CLIENT_NAME")?,
        &required("BUS_HOST")?,
        &required("BUS_USER")?,
        &required("BUS_PASSWORD")?,
    );
    if let Some(port) = parsed::<u16>("BUS_PORT")? {
        connection.port = port;
    }
    if let Ok(vhost) = env::var("BUS_VIRTUAL_HOST") {
        connection.virtual_host = vhost;
    }
    if let Ok(ca) = env::var("BUS_TLS_CA_CERT") {
        connection.tls = Some(TlsConfig {
            ca_cert_path: Some(PathBuf::from(ca)),
        });
    } else if parsed::<bool>("BUS_TLS")?.unwrap_or(false) {
        connection.tls = Some(TlsConfig::default());
    }
    connection.validate()?;

    let mut consumer = ConsumerConfig::default();
    if let Some(prefetch) = parsed::<u16>("BUS_PREFETCH_COUNT")? {
        consumer.prefetch_count = prefetch;
    }

    let mut publisher = PublisherConfig::default();
    if let Some(retries) = parsed::<u32>("BUS_PUBLISH_RETRIES")? {
        publisher.retry_count = Some(retries);
    }

    Ok(BusConfig {
        connection,
        consumer,
        publisher,
    })
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("Environment variable {} is not set", name))
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map(Some)
            .with_context(|| format!("Environment variable {} has an invalid value", name)),
        Err(_) => Ok(None),
    }
}
