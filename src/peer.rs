use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Webrtc(#[from] webrtc::Error),
    #[error("peer connection has no local description after applying the offer")]
    MissingLocalDescription,
}

/// Receive-only peer connection accepting a single H.264 video track.
#[derive(Clone)]
pub struct ReceiverPeer {
    pc: Arc<RTCPeerConnection>,
    gather_timeout: Duration,
}

impl ReceiverPeer {
    pub async fn new(
        stun_urls: &[String],
        gather_timeout: Duration,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        for codec in h264_codec_params() {
            media_engine.register_codec(codec, RTPCodecType::Video)?;
        }
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        pc.on_peer_connection_state_change(Box::new(|state: RTCPeerConnectionState| {
            info!(%state, "connection state changed");
            async {}.boxed()
        }));
        pc.on_ice_connection_state_change(Box::new(|state: RTCIceConnectionState| {
            info!(%state, "ICE state changed");
            async {}.boxed()
        }));

        Ok(Self { pc, gather_timeout })
    }

    /// Calls `handler` for every remote video track; other kinds are ignored.
    pub fn on_video_track<F>(&self, handler: F)
    where
        F: Fn(Arc<TrackRemote>, Arc<RTCRtpReceiver>) + Send + Sync + 'static,
    {
        self.pc.on_track(Box::new(move |track, receiver, _transceiver| {
            match track.kind() {
                RTPCodecType::Video => {
                    let codec = track.codec();
                    info!(
                        mime_type = %codec.capability.mime_type,
                        ssrc = track.ssrc(),
                        "video track started"
                    );
                    handler(track, receiver);
                }
                kind => warn!(%kind, "ignoring non-video track"),
            }
            async {}.boxed()
        }));
    }

    /// Creates the SDP offer, applies it locally and waits (bounded) for ICE
    /// gathering so the returned SDP carries the candidates.
    pub async fn local_offer(&self) -> Result<String, PeerError> {
        let gather_timeout = self.gather_timeout;
        let offer = self.pc.create_offer(None).await?;
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;

        if tokio::time::timeout(gather_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            debug!(?gather_timeout, "ICE gathering did not complete in time");
        }

        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or(PeerError::MissingLocalDescription)
    }

    pub async fn apply_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        info!("remote description set");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), PeerError> {
        Ok(self.pc.close().await?)
    }
}

/// Asks the sender for a fresh keyframe on `track`.
pub async fn request_keyframe(track: &TrackRemote, receiver: &RTCRtpReceiver) {
    let pli = PictureLossIndication {
        // receive-only, so there is no sender SSRC of our own
        sender_ssrc: 0,
        media_ssrc: track.ssrc(),
    };
    let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![Box::new(pli)];
    match receiver.transport().write_rtcp(&packets).await {
        Ok(_) => debug!(ssrc = track.ssrc(), "requested keyframe"),
        Err(e) => debug!(error = %e, "failed to send PLI"),
    }
}

fn h264_codec_params() -> Vec<RTCRtpCodecParameters> {
    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];
    [
        (
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            102,
        ),
        (
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f",
            127,
        ),
        (
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            125,
        ),
        (
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f",
            108,
        ),
        (
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032",
            123,
        ),
    ]
    .into_iter()
    .map(|(fmtp, payload_type)| RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_owned(),
            rtcp_feedback: feedback.clone(),
        },
        payload_type,
        ..Default::default()
    })
    .collect()
}
