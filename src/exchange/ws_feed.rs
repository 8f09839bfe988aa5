// =============================================================================
// WebSocket Feed — one connection, one subscription, cancel-aware
// =============================================================================
//
// A thin transport used by live adapters: connect to a public market-data
// stream, hand every text frame to the caller's parser, and return when the
// stream ends, errors, or the stop signal flips. Reconnection policy lives
// with the caller — a feed that returns is simply dialled again after a
// short pause, so one flapping symbol never wedges the manager.
// =============================================================================

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Connect to `url` and feed every text frame into `on_frame` until the
/// stream closes or `stop` flips to `true`.
///
/// Returns `Ok(())` on a clean end (remote close or stop signal) and
/// `Err(Transient)` on a transport error, letting the caller decide whether
/// to retry.
pub async fn run_json_feed<F>(
    url: &str,
    mut on_frame: F,
    mut stop: watch::Receiver<bool>,
) -> EngineResult<()>
where
    F: FnMut(&str) + Send,
{
    debug!(url = %url, "connecting WebSocket feed");

    let (ws_stream, _response) = connect_async(url)
        .await
        .map_err(|e| EngineError::Transient(format!("websocket connect failed: {e}")))?;

    info!(url = %url, "WebSocket feed connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            // Stop signal wins over pending frames.
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(url = %url, "WebSocket feed stopped by signal");
                    return Ok(());
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                            on_frame(&text);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(url = %url, error = %e, "WebSocket feed read error");
                        return Err(EngineError::Transient(format!(
                            "websocket read error: {e}"
                        )));
                    }
                    None => {
                        debug!(url = %url, "WebSocket feed ended by remote");
                        return Ok(());
                    }
                }
            }
        }
    }
}
