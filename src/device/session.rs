use std::time::Instant;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::device::engine::Engine;
use crate::device::platform::{Platform, PlatformEvent};
use crate::device::types::{DeviceId, SessionCommand, Snapshot};
use crate::error::DeviceError;

/// Presentation-side handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    async fn send(&mut self, command: SessionCommand) -> Result<(), DeviceError> {
        self.commands.send(command).await?;
        Ok(())
    }

    pub async fn request_scan(&mut self, start: bool) -> Result<(), DeviceError> {
        self.send(SessionCommand::Scan(start)).await
    }

    pub async fn request_connect(&mut self, id: DeviceId) -> Result<(), DeviceError> {
        self.send(SessionCommand::Connect(id)).await
    }

    pub async fn request_reconcile(&mut self) -> Result<(), DeviceError> {
        self.send(SessionCommand::Reconcile).await
    }

    pub async fn request_services(&mut self, id: DeviceId) -> Result<(), DeviceError> {
        self.send(SessionCommand::ResolveServices(id)).await
    }
}

fn apply_command<P: Platform>(engine: &mut Engine<P>, command: SessionCommand) {
    let result = match command {
        SessionCommand::Scan(true) => {
            engine.begin_scan();
            Ok(())
        },
        SessionCommand::Scan(false) => {
            engine.end_scan();
            Ok(())
        },
        SessionCommand::Connect(id) => engine.connect(&id),
        SessionCommand::Reconcile => {
            engine.request_reconcile();
            Ok(())
        },
        SessionCommand::ResolveServices(id) => engine.request_services(&id),
    };

    // rejected requests are the caller's business, the session keeps running
    if let Err(err) = result {
        warn!("Request rejected: {}", err);
    }
}

/// Runs `engine` on its own task. All commands, platform events and deadline checks are
/// applied one at a time on that task.
pub fn spawn_session<P: Platform + 'static>(
    cancel: CancellationToken,
    mut engine: Engine<P>,
    mut events: Receiver<PlatformEvent>,
    expiry_poll: Duration,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_sender, mut command_receiver) = channel::<SessionCommand>(32);
    let snapshots = engine.subscribe();

    let handle = spawn(async move {
        let mut expiry = interval(expiry_poll);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(command) = command_receiver.next() => {
                    apply_command(&mut engine, command);
                },
                Some(event) = events.next() => {
                    engine.handle(event);
                },
                _ = expiry.tick() => {
                    engine.expire_pending(Instant::now());
                },
            }
        }

        info!("Bluetooth session stopped");
    });

    (SessionHandle { commands: command_sender, snapshots }, handle)
}
