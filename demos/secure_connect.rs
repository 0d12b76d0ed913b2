//! Open a secure channel to a server, send one raw request and close again
//!
//! Usage:
//!
//! ```text
//! secure_connect <endpoint-url> [<pki-dir>]
//! ```
//!
//! Without a PKI directory the channel uses the None policy. With one, the
//! client signs and encrypts with Basic256Sha256 and expects:
//!
//! ```text
//! <pki-dir>/own/cert.der        client certificate
//! <pki-dir>/own/private.pem     client private key (PKCS#8)
//! <pki-dir>/server.der          server certificate
//! <pki-dir>/trusted/...         trust list (see TrustList::load_from_dir)
//! ```
//!
//! A rejected server certificate is written to `<pki-dir>/rejected`.

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use opcua_uasc::certificate::{Certificate, DefaultCertificateValidator};
use opcua_uasc::client::{RawMessage, UascClient, UascClientConfig};
use opcua_uasc::encoding::{write_string, NodeId, RequestHeader};
use opcua_uasc::security::{uris, MessageSecurityMode, PrivateKey};

/// GetEndpointsRequest binary encoding
const GET_ENDPOINTS_REQUEST: u32 = 428;

fn get_endpoints_body(endpoint_url: &str) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::new();
    RequestHeader::new(1, 0, 10_000).encode(&mut buf);
    write_string(&mut buf, Some(endpoint_url));
    // Empty locale id and profile uri arrays
    buf.extend_from_slice(&(-1i32).to_le_bytes());
    buf.extend_from_slice(&(-1i32).to_le_bytes());
    buf.freeze()
}

fn secure_config(
    endpoint_url: &str,
    pki: &Path,
) -> Result<UascClientConfig, Box<dyn std::error::Error>> {
    let certificate = Certificate::from_file(pki.join("own").join("cert.der"))?;
    let key = PrivateKey::from_pkcs8_pem(&std::fs::read(pki.join("own").join("private.pem"))?)?;
    let server_certificate = Certificate::from_file(pki.join("server.der"))?;
    let validator = DefaultCertificateValidator::from_dir(pki)?;

    let config = UascClientConfig::builder(endpoint_url)
        .security(uris::BASIC256_SHA256, MessageSecurityMode::SignAndEncrypt)
        .certificate(vec![certificate], key)
        .server_certificate(server_certificate)
        .certificate_validator(Arc::new(validator))
        .request_timeout(Duration::from_secs(10))
        .build()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let endpoint_url = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "opc.tcp://localhost:4840".to_string());

    let config = match args.get(2) {
        Some(pki) => secure_config(&endpoint_url, Path::new(pki))?,
        None => UascClientConfig::builder(&endpoint_url)
            .on_channel_inactive(|error| eprintln!("channel inactive: {}", error))
            .build()?,
    };

    println!("Connecting to {}", endpoint_url);
    let client = UascClient::new(config);
    client.connect().await?;
    println!("Secure channel open ({})", client.state());

    let request = RawMessage::new(
        NodeId::ns0(GET_ENDPOINTS_REQUEST),
        get_endpoints_body(&endpoint_url),
    );
    match client.send(&request).await {
        Ok(response) => println!(
            "Response {:?}, {} bytes",
            response.type_id,
            response.body.len()
        ),
        Err(e) => println!("Request failed: {}", e),
    }

    client.close().await?;
    println!("Closed");
    Ok(())
}

