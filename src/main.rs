use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{debug, error, info, warn};

use open_music_sessions::{
    audio::songbird_engine::SongbirdEngine,
    bot::WorkerBot,
    cluster::{
        memory::MemoryNetwork, tcp::TcpTransport, LocalDirectory, OwnershipDirectory,
        RemoteDirectory, Transport,
    },
    config::Config,
    session::{events::EventHandler, SessionEvent, SessionRegistry},
};

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_sessions=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Sessions v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check());
    }

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    // Transporte entre procesos
    let network = MemoryNetwork::new();
    let transport: Arc<dyn Transport> = match config.listen_addr {
        None => {
            info!("🏠 Modo standalone: red en memoria");
            network.join(config.node_name.clone())
        }
        Some(addr) => {
            let tcp = Arc::new(TcpTransport::new(config.node_name.clone(), config.peers.clone()));
            let listener = TcpListener::bind(addr).await?;
            let server = tcp.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!("❌ El listener del nodo se cerró: {:?}", e);
                }
            });
            tcp
        }
    };

    // Directorio de dueños
    let directory: Arc<dyn OwnershipDirectory> = if config.is_coordinator() {
        info!("🧭 Este nodo es el coordinador");
        Arc::new(LocalDirectory::new())
    } else {
        info!("🧭 Coordinador: {}", config.coordinator);
        Arc::new(RemoteDirectory::new(
            config.coordinator.clone(),
            transport.clone(),
            config.remote_timeout,
        ))
    };

    // Motor de audio
    let manager = Songbird::serenity();
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = Arc::new(SongbirdEngine::new(
        manager.clone(),
        events_tx.clone(),
        config.position_interval,
    ));

    let registry = SessionRegistry::new(
        engine,
        transport,
        directory,
        config.session_settings(),
        config.remote_timeout,
    );
    tokio::spawn(EventHandler::new(registry.clone(), events_rx).run());
    tokio::spawn(history_logger(registry.subscribe()));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = WorkerBot::new(registry.clone(), events_tx);
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(manager)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown_registry.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Nodo {} iniciado exitosamente", registry.node());
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    drop(network);
    Ok(())
}

/// Deja en el log lo que ven los observadores.
async fn history_logger(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::NowPlaying { context, track }) => {
                info!("🎶 [{}] {} (pedido por {})", context, track.title(), track.requested_by);
            }
            Ok(SessionEvent::StateChanged(snapshot)) => {
                debug!("📋 [{}] v{} {}", snapshot.context, snapshot.version, snapshot.state);
            }
            Ok(SessionEvent::Position { .. }) => {}
            Ok(SessionEvent::Failed { context, error }) => warn!("⚠️ [{}] {}", context, error),
            Ok(SessionEvent::Closed { context }) => info!("👋 [{}] sesión cerrada", context),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Historial atrasado, {} eventos perdidos", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    if yt_dlp.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes: yt-dlp");
    }
}
