//! Inbound demultiplexer
//!
//! Reads frames for as long as the connection lives and hands each to the
//! correlator. Any read failure, a clean close from the peer, or a frame the
//! correlator cannot place breaks the connection, which fails every
//! outstanding query.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::connection::LinkHandle;
use super::correlator::Correlator;
use super::transport::FrameReader;
use crate::types::CauldronError;

pub(crate) async fn run(
    mut reader: Box<dyn FrameReader>,
    correlator: Arc<Correlator>,
    link: LinkHandle,
) {
    loop {
        match reader.read().await {
            Ok(Some(frame)) => {
                link.activity();
                if let Err(e) = correlator.route(&frame) {
                    error!(generation = link.generation(), error = %e, "Unroutable frame, closing connection");
                    link.broken(e);
                    return;
                }
            }
            Ok(None) => {
                info!(generation = link.generation(), "Connection closed by peer");
                link.broken(CauldronError::ConnectionLost(
                    "Connection closed by server".into(),
                ));
                return;
            }
            Err(e) => {
                warn!(generation = link.generation(), error = %e, "Read failed, closing connection");
                link.broken(CauldronError::ConnectionLost(format!("Read failed: {}", e)));
                return;
            }
        }
    }
}
