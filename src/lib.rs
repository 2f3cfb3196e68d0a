pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod hub;
pub mod llm;
pub mod models;
pub mod server;
pub mod store;
pub mod sync;

use cli::Args;
use config::prompt::SystemPrompt;
use exchange::MessageExchange;
use hub::BroadcastHub;
use log::info;
use server::api::AppState;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Conversation Store Type: {}", args.storage_type);
    info!("DB Pool Size: {}", args.db_pool_size);
    info!("Model Runtime Base URL: {}", args.ollama_base_url);
    info!("Fallback Default Model: {}", args.default_model);
    info!("Completion Timeout: {}s", args.llm_timeout_secs);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let store = store::initialize_conversation_store(&args).await?;

    // seed the stored default so the very first exchange already has one
    if store.get_default_model().await?.is_none() {
        store.set_default_model(&args.default_model).await?;
        info!("Registered '{}' as the default model", args.default_model);
    }

    let gateway = llm::new_gateway(&args)?;
    let hub = Arc::new(BroadcastHub::new());
    let system_prompt = SystemPrompt::new(args.system_prompt.clone());
    let exchange = Arc::new(
        MessageExchange::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&hub),
            system_prompt.clone(),
            args.default_model.clone()
        )
    );

    let state = AppState {
        store,
        gateway,
        exchange,
        hub,
        system_prompt,
    };

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, state, args);
    server.run().await?;

    Ok(())
}
