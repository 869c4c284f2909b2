//! `baton server`: Start the Baton HTTP server and its sweepers.

use baton_core::AppState;

pub async fn run(
    state: &AppState,
    host: String,
    port: u16,
    run_sweepers: bool,
) -> Result<(), String> {
    let config = baton_server::ServerConfig {
        host: host.clone(),
        port,
        run_sweepers,
        ..baton_server::ServerConfig::default()
    };

    println!("Starting Baton server on {}:{}...", host, port);

    let handle = baton_server::start_server_with_state(config, state.clone()).await?;
    println!("Baton server listening on http://{}", handle.addr);

    // Keep the process running until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    handle.shutdown().await;
    Ok(())
}
