use anyhow::Context;
use polyserve::config::Config;
use polyserve::http::request::Method;
use polyserve::http::route::handler;
use polyserve::server::Server;
use polyserve::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let mut hosts = cfg.host_table()?;

    // Built-in endpoints on every host: a health check and a WebSocket echo.
    for index in 0..hosts.len() {
        let Some(host) = hosts.get_mut(index) else {
            continue;
        };
        host.add_route(
            "/health",
            Method::GET,
            handler(|_req, res| {
                res.set_header("Content-Type", "text/plain");
                res.write("ok");
            }),
        )?;
        host.add_websocket(
            "/echo",
            ws_handler(|req, res| match req.text() {
                Some(text) => res.text(text),
                None => res.binary(req.payload.to_vec()),
            }),
        )?;
    }

    let server = Server::bind(cfg, hosts)?;
    let shutdown = server.shutdown_handle();
    let mut task = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        res = &mut task => {
            res.context("server task failed")??;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            shutdown.shutdown();
            task.await.context("server task failed")??;
        }
    }

    Ok(())
}
