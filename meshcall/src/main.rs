use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use meshcall_core::{
    bootstrap::{init_controller, load_config, TransportKind},
    logging,
    models::{LocalParticipant, ParticipantId, RoomId},
    service::{LoopbackNetwork, MemoryDirectory, MemoryRelay, PeerEvent, RoomController},
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    /// Real peer connections over loopback UDP
    Webrtc,
    /// In-process pairing, no sockets
    Loopback,
}

#[derive(Parser, Debug)]
#[command(name = "meshcall")]
#[command(about = "Run a full-mesh call between local participants", long_about = None)]
struct Args {
    /// Room to join
    #[arg(long, env = "MESHCALL_ROOM", default_value = "lobby")]
    room: String,

    /// Display names, one participant each, joined in this order
    #[arg(long, value_delimiter = ',', default_value = "alice,bob,carol")]
    participants: Vec<String>,

    /// Seconds to stay in the call; 0 waits for Ctrl-C
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Config file path
    #[arg(long, env = "MESHCALL_CONFIG_PATH")]
    config: Option<String>,

    #[arg(long, value_enum, default_value = "webrtc")]
    transport: Transport,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging, the guard flushes the file appender on exit
    let _log_guard = logging::init_logging(&config.logging)?;
    info!("MeshCall starting...");

    if args.participants.is_empty() {
        return Err(anyhow::anyhow!("at least one participant is required"));
    }

    // 3. Shared room infrastructure
    let directory = MemoryDirectory::new();
    let relay = MemoryRelay::new();
    let transport = match args.transport {
        Transport::Webrtc => TransportKind::WebRtc,
        Transport::Loopback => TransportKind::Loopback(LoopbackNetwork::new()),
    };
    info!(transport = transport.name(), room = %args.room, "Room infrastructure ready");

    // 4. Join everyone in order
    let room_id = RoomId::from_name(&args.room);
    let mut controllers: Vec<(String, Arc<RoomController>)> = Vec::new();
    for name in &args.participants {
        let id = ParticipantId::new();
        let (controller, events) = init_controller(
            &config,
            &id,
            Arc::new(directory.clone()),
            Arc::new(relay.clone()),
            &transport,
        );
        let controller = Arc::new(controller);

        match controller
            .join_room(room_id.clone(), LocalParticipant::new(id.clone(), name.clone()))
            .await
        {
            Ok(record) => {
                info!(name = %name, participant_id = %record.id, join_seq = record.join_seq, "Participant joined");
                tokio::spawn(log_events(name.clone(), events));
                controllers.push((name.clone(), controller));
            }
            Err(e) if e.is_fatal() => {
                error!(name = %name, error = %e, "Participant could not join");
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Participant join failed");
            }
        }
    }

    // 5. Stay in the call
    if args.duration == 0 {
        info!("In call, press Ctrl-C to leave");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
            result = tokio::signal::ctrl_c() => result?,
        }
    }

    for (name, controller) in &controllers {
        let sessions = controller.sessions().await;
        for session in sessions {
            info!(
                name = %name,
                remote = %session.remote_display_name,
                state = %session.state,
                role = ?session.role,
                remote_tracks = session.remote_stream.map_or(0, |s| s.tracks.len()),
                "Session summary"
            );
        }
    }

    // 6. Leave
    let leaves = controllers.iter().map(|(name, controller)| async move {
        if let Err(e) = controller.leave_room().await {
            error!(name = %name, error = %e, "Leave failed");
        }
    });
    futures::future::join_all(leaves).await;

    info!("MeshCall stopped");
    Ok(())
}

async fn log_events(name: String, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            PeerEvent::SessionStateChanged { remote_id, from, to } => {
                info!(name = %name, remote_id = %remote_id, from = %from, to = %to, "Session state changed");
            }
            PeerEvent::RemoteStreamAdded { remote_id, display_name, stream } => {
                info!(
                    name = %name,
                    remote_id = %remote_id,
                    remote = %display_name,
                    tracks = stream.tracks.len(),
                    "Remote stream added"
                );
            }
            PeerEvent::RemoteStreamRemoved { remote_id } => {
                info!(name = %name, remote_id = %remote_id, "Remote stream removed");
            }
        }
    }
}
