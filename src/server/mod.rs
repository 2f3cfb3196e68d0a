pub mod api;
pub mod push;

use crate::cli::Args;
use std::error::Error;
use std::net::SocketAddr;
use log::{info, warn};

use api::AppState;

pub struct Server {
    addr: String,
    state: AppState,
    args: Args,
}

impl Server {
    pub fn new(addr: String, state: AppState, args: Args) -> Self {
        Self { addr, state, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let app = api::router(self.state.clone());

        if self.args.enable_tls {
            if
                let (Some(cert_path), Some(key_path)) = (
                    &self.args.tls_cert_path,
                    &self.args.tls_key_path,
                )
            {
                let addr = self.addr.parse::<SocketAddr>()?;
                let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_path,
                    key_path
                ).await?;

                info!("HTTPS server listening on: https://{}", addr);
                axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
                return Ok(());
            }
            warn!(
                "TLS was enabled without both --tls-cert-path and --tls-key-path. Serving plain HTTP."
            );
        }

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("HTTP server listening on: http://{}", self.addr);
        axum::serve(listener, app.into_make_service()).await?;

        Ok(())
    }
}
