//! MCP server initialization for stdio and streamable HTTP transports.
//!
//! Both entry points expose the router's invocation kinds as MCP tools. The
//! server only ever acts on explicit tool calls.

use crate::config::ScriptoriumConfig;
use crate::router::Router;
use crate::tools::ScriptoriumTools;
use anyhow::Result;
use rmcp::ServiceExt;

fn warn_on_model_mismatch(router: &Router) {
    let stored = crate::db::open_connection(router.config().corpus_db_path())
        .ok()
        .and_then(|conn| crate::db::migrations::get_embedding_model(&conn).ok().flatten());
    if let (Some(stored), Some(configured)) = (stored, router.embedding_model()) {
        if stored != configured {
            tracing::warn!(
                stored = %stored,
                configured = %configured,
                "embedding model changed, run `scriptorium doctor --repair` to rebuild vectors"
            );
        }
    }
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(router: Router) -> Result<()> {
    tracing::info!("starting Scriptorium MCP server on stdio");
    warn_on_model_mismatch(&router);

    let tools = ScriptoriumTools::new(router);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP transport.
pub async fn serve_http(router: Router) -> Result<()> {
    let config: &ScriptoriumConfig = router.config();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    tracing::info!(addr = %bind_addr, "starting Scriptorium MCP server on HTTP");
    warn_on_model_mismatch(&router);

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(ScriptoriumTools::new(router.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let app = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    Ok(())
}
