//! Session heartbeat task.
//!
//! One pinger runs per connection. It writes an encoded heartbeat frame at
//! a fixed interval so an otherwise quiet peer can tell the server is
//! alive. Real traffic defers the next heartbeat via the reset channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::logger::Logger;
use crate::protocol::{Payload, PayloadCodec, ProtocolError};
use crate::server::Deadlines;

/// Run the heartbeat loop until cancellation.
///
/// The interval starts at `interval`, unless a value is already waiting on
/// the reset channel. A reset of zero re-arms the current interval from
/// now; a positive reset replaces the interval. A failed write is logged
/// and the loop keeps going; the owner cancels the token when the session
/// ends.
pub async fn run<W>(
    cancel: CancellationToken,
    writer: Arc<Mutex<FramedWrite<W, PayloadCodec>>>,
    deadlines: Deadlines,
    interval: Duration,
    mut reset: mpsc::Receiver<Duration>,
    logger: Arc<Logger>,
) where
    W: AsyncWrite + Unpin,
{
    let mut interval = interval;
    if let Ok(first) = reset.try_recv() {
        if first > Duration::ZERO {
            interval = first;
        }
    }

    let timer = time::sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            new_interval = reset.recv() => {
                let Some(new_interval) = new_interval else {
                    return;
                };
                if new_interval > Duration::ZERO {
                    interval = new_interval;
                }
            }
            _ = timer.as_mut() => {
                if let Err(e) = send_heartbeat(&writer, &deadlines).await {
                    logger.error(&format!("heartbeat write failed: {e}"));
                }
            }
        }

        timer.as_mut().reset(Instant::now() + interval);
    }
}

/// Write one heartbeat frame, bounded by the session write deadline.
///
/// Heartbeats never extend the read deadline; an idle peer still times out.
async fn send_heartbeat<W>(
    writer: &Mutex<FramedWrite<W, PayloadCodec>>,
    deadlines: &Deadlines,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let outcome = time::timeout_at(deadlines.write_deadline(), async {
        writer.lock().await.send(Payload::HeartBeat).await
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline elapsed",
        ))),
    }
}
