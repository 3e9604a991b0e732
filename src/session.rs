use std::future::Future;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use url::Url;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::decoder::H264Decoder;
use crate::depacketizer::AccessUnitAssembler;
use crate::gate::{FrameSink, SnapshotGate};
use crate::peer::{request_keyframe, PeerError, ReceiverPeer};
use crate::settings::Settings;
use crate::signaling::{SignalingError, WhepClient};
use crate::ticker::SnapshotTicker;
use crate::writer::{JpegFileWriter, WriterTask};

/// Access units buffered between the RTP reader and the decoder thread.
const ACCESS_UNIT_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer connection failed: {0}")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// The local half of an SDP offer/answer exchange.
#[allow(async_fn_in_trait)]
pub trait Negotiator {
    async fn local_offer(&self) -> Result<String, PeerError>;
    async fn apply_answer(&self, sdp: String) -> Result<(), PeerError>;
}

impl Negotiator for ReceiverPeer {
    async fn local_offer(&self) -> Result<String, PeerError> {
        ReceiverPeer::local_offer(self).await
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), PeerError> {
        ReceiverPeer::apply_answer(self, sdp).await
    }
}

/// Posts the local offer and applies the answer. Nothing is applied unless
/// the server accepted the offer.
///
/// Returns the WHEP session URL when the server announced one.
pub async fn negotiate<N: Negotiator>(
    peer: &N,
    client: &WhepClient,
) -> Result<Option<Url>, SessionError> {
    let offer = peer.local_offer().await?;
    debug!(sdp = %offer, "local offer");
    let answer = client.send_offer(&offer).await?;
    debug!(sdp = %answer.sdp, "remote answer");
    peer.apply_answer(answer.sdp).await?;
    Ok(answer.session_url)
}

/// Runs a snapshot session until `shutdown` resolves.
///
/// A failed negotiation ends the session with an error; there is no retry.
pub async fn run<F>(settings: &Settings, shutdown: F) -> Result<(), SessionError>
where
    F: Future<Output = ()>,
{
    let writer = JpegFileWriter::new(settings.output_path(), settings.jpeg_quality);
    info!(
        path = %writer.path().display(),
        interval = ?settings.snapshot_interval(),
        "saving snapshots"
    );
    let (sink, writer_task) = WriterTask::spawn(writer);
    let gate = Arc::new(SnapshotGate::new(sink));
    let ticker = SnapshotTicker::start(gate.latch().clone(), settings.snapshot_interval());

    let result = connect(settings, gate, shutdown).await;

    ticker.stop().await;
    writer_task.shutdown().await;
    result
}

async fn connect<S, F>(
    settings: &Settings,
    gate: Arc<SnapshotGate<S>>,
    shutdown: F,
) -> Result<(), SessionError>
where
    S: FrameSink + 'static,
    F: Future<Output = ()>,
{
    let peer = ReceiverPeer::new(
        &settings.stun_server_urls,
        settings.ice_gathering_timeout(),
    )
    .await?;
    peer.on_video_track(move |track, receiver| {
        spawn_video_pipeline(track, receiver, gate.clone());
    });

    let client = WhepClient::new(
        settings.signaling_url.clone(),
        settings.bearer_token.clone(),
    );
    let session_url = match negotiate(&peer, &client).await {
        Ok(session_url) => session_url,
        Err(e) => {
            if let Err(close_err) = peer.close().await {
                debug!(error = %close_err, "failed to close peer connection");
            }
            return Err(e);
        }
    };

    info!("press Enter to exit");
    shutdown.await;
    info!("shutting down");

    if let Some(session_url) = &session_url {
        client.delete_session(session_url).await;
    }
    peer.close().await?;
    Ok(())
}

/// RTP reader task -> bounded channel -> decoder thread -> gate.
///
/// FFmpeg state stays on its own thread, so a slow decode never stalls the
/// async runtime.
fn spawn_video_pipeline<S>(
    track: Arc<TrackRemote>,
    receiver: Arc<RTCRtpReceiver>,
    gate: Arc<SnapshotGate<S>>,
) where
    S: FrameSink + 'static,
{
    let (access_units, pending) = mpsc::channel(ACCESS_UNIT_BUFFER);
    let decoder = thread::Builder::new()
        .name("h264-decoder".to_owned())
        .spawn(move || decode_access_units(pending, gate));
    if let Err(e) = decoder {
        error!(error = %e, "failed to start decoder thread");
        return;
    }

    tokio::spawn(async move {
        request_keyframe(&track, &receiver).await;
        read_access_units(&track, access_units).await;
    });
}

async fn read_access_units(track: &TrackRemote, access_units: mpsc::Sender<Bytes>) {
    let mut assembler = AccessUnitAssembler::new();
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                info!(error = %e, "video track ended");
                return;
            }
        };
        match assembler.push(&packet.payload, packet.header.marker) {
            Ok(Some(access_unit)) => {
                if access_units.send(access_unit).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "dropping access unit"),
        }
    }
}

fn decode_access_units<S: FrameSink>(
    mut access_units: mpsc::Receiver<Bytes>,
    gate: Arc<SnapshotGate<S>>,
) {
    let mut decoder = match H264Decoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            error!(error = %e, "no snapshots will be taken");
            return;
        }
    };
    while let Some(access_unit) = access_units.blocking_recv() {
        let decoded = decoder.decode(&access_unit, |frame| {
            gate.on_frame_delivered(frame);
        });
        // Expected until the first keyframe arrives.
        if let Err(e) = decoded {
            debug!(error = %e, "failed to decode access unit");
        }
    }
    debug!("decoder thread exiting");
}

/// Resolves once Enter is pressed or Ctrl-C is received. Without an
/// interactive stdin only Ctrl-C ends the wait.
pub async fn wait_for_exit() {
    let enter = enter_pressed();
    tokio::select! {
        _ = async {
            if enter.await.is_err() {
                std::future::pending::<()>().await;
            }
        } => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
        }
    }
}

// A plain thread rather than `tokio::io::stdin`, which would keep the runtime
// from shutting down while the read is pending.
fn enter_pressed() -> oneshot::Receiver<()> {
    let (pressed, enter) = oneshot::channel();
    let spawned = thread::Builder::new()
        .name("stdin".to_owned())
        .spawn(move || {
            let mut line = String::new();
            if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
                let _ = pressed.send(());
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to watch stdin");
    }
    enter
}
