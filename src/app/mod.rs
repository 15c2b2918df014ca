use crate::config::Config;
use crate::harness::{self, HarnessOptions};
use crate::model::{DirectLink, DirectLinkStatus, MediaKind, MediaRequest, QualityLink};
use crate::plugin::PluginMetadata;
use crate::progress::ProgressUpdate;
use crate::server::{self, ServerState};
use crate::session::{PluginHandler, StreamRequest};
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if let Some(command) = args.first() {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "test" {
            let config = Config::load()?;
            return handle_test(&config, &args[1..]).await;
        }
        if command != "serve" {
            return Err(format!("unknown command `{command}`").into());
        }
    }

    let config = Config::load()?;
    serve(config).await
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    let plugin = config.plugin.clone().build()?;
    tracing::info!(plugin = %plugin.name, version = ?plugin.version, "serving plugin");
    let handler: Arc<dyn PluginHandler> = Arc::new(EmbedHandler { plugin });
    let state = Arc::new(ServerState::new(handler, &config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    server::start(listener, state, shutdown_rx).await
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_test(config: &Config, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (url, media) = parse_test_args(args)?;
    let options = HarnessOptions::from(&config.harness);
    match harness::run_test(&url, &media, options).await? {
        Some(link) => println!("{}", serde_json::to_string_pretty(&link)?),
        None => println!("no result for {}", media.describe()),
    }
    Ok(())
}

pub fn parse_test_args(args: &[String]) -> Result<(String, MediaRequest), String> {
    let usage = "usage: test <ws-url> <media_id> [movie|tv] [season] [episode]";
    let (Some(url), Some(media_id)) = (args.first(), args.get(1)) else {
        return Err(usage.to_string());
    };
    let mut media = MediaRequest::new(media_id.as_str());
    match args.get(2).map(String::as_str) {
        None | Some("movie") => media.media_kind = Some(MediaKind::Movie),
        Some("tv") => {
            media.media_kind = Some(MediaKind::Tv);
            media.season_id = Some(args.get(3).cloned().unwrap_or_else(|| "1".to_string()));
            media.episode_id = Some(args.get(4).cloned().unwrap_or_else(|| "1".to_string()));
        }
        Some(other) => return Err(format!("unknown media type `{other}`; {usage}")),
    }
    Ok((url.clone(), media))
}

struct EmbedHandler {
    plugin: PluginMetadata,
}

impl EmbedHandler {
    fn resolve(&self, media: &MediaRequest) -> String {
        let template = match (media.media_kind, &self.plugin.tv_embed_url) {
            (Some(MediaKind::Tv), Some(tv)) => tv,
            _ => &self.plugin.embed_url,
        };
        fill_template(template, media)
    }
}

impl PluginHandler for EmbedHandler {
    fn on_stream(&self, request: StreamRequest) -> BoxFuture<'static, ()> {
        let link = DirectLink {
            qualities: vec![QualityLink::new("auto", self.resolve(&request.media))],
            status: Some(DirectLinkStatus::FinalResult),
            source_name: Some(self.plugin.name.clone()),
            ..Default::default()
        };
        async move {
            request.controller.progress(ProgressUpdate::Auto);
            request.controller.finish(link).await;
        }
        .boxed()
    }

    fn on_listening(&self, addr: SocketAddr) {
        println!("plugin bridge ready on ws://{addr}");
    }
}

pub fn fill_template(template: &str, media: &MediaRequest) -> String {
    template
        .replace("{media_id}", &media.media_id)
        .replace(
            "{media_type}",
            media.media_kind.map(MediaKind::as_str).unwrap_or("movie"),
        )
        .replace("{season_id}", media.season_id.as_deref().unwrap_or(""))
        .replace("{episode_id}", media.episode_id.as_deref().unwrap_or(""))
}
