use bytes::Bytes;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packetizer::Depacketizer;

#[derive(Debug, thiserror::Error)]
#[error("failed to depacketize H.264 payload: {0}")]
pub struct DepacketizeError(#[from] webrtc::rtp::Error);

/// Reassembles H.264 access units (Annex B) from RTP payloads.
///
/// Each payload is depacketized as it arrives; the collected NAL units are
/// emitted together once the packet carrying the marker bit is seen.
#[derive(Default)]
pub struct AccessUnitAssembler {
    depacketizer: H264Packet,
    fragments: Vec<Bytes>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        payload: &Bytes,
        marker: bool,
    ) -> Result<Option<Bytes>, DepacketizeError> {
        if payload.is_empty() {
            return Ok(None);
        }
        let nalus = match self.depacketizer.depacketize(payload) {
            Ok(nalus) => nalus,
            Err(e) => {
                self.reset();
                return Err(e.into());
            }
        };
        if !nalus.is_empty() {
            self.fragments.push(nalus);
        }
        if !marker || self.fragments.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.fragments).concat().into()))
    }

    /// Drops any partially assembled access unit.
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.depacketizer = H264Packet::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: [u8; 4] = [0, 0, 0, 1];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        nals.iter()
            .flat_map(|nal| START.iter().chain(nal.iter()).copied())
            .collect()
    }

    #[test]
    fn single_nal_with_marker_is_emitted() {
        let mut assembler = AccessUnitAssembler::new();
        let nal = [0x65, 0x88, 0x84];
        let au = assembler
            .push(&Bytes::copy_from_slice(&nal), true)
            .unwrap()
            .unwrap();
        assert_eq!(au.as_ref(), annexb(&[&nal]).as_slice());
    }

    #[test]
    fn nals_are_collected_until_marker() {
        let mut assembler = AccessUnitAssembler::new();
        let sps = [0x67, 0x42, 0x00, 0x1f];
        let pps = [0x68, 0xce, 0x3c, 0x80];
        let idr = [0x65, 0xb8, 0x00];

        for nal in [&sps, &pps] {
            let pending = assembler.push(&Bytes::copy_from_slice(nal), false).unwrap();
            assert!(pending.is_none());
        }
        let au = assembler
            .push(&Bytes::copy_from_slice(&idr), true)
            .unwrap()
            .unwrap();
        assert_eq!(au.as_ref(), annexb(&[&sps, &pps, &idr]).as_slice());
    }

    #[test]
    fn fragmented_nal_is_reassembled() {
        let mut assembler = AccessUnitAssembler::new();
        // FU-A indicator (nri=3, type 28), header start/end bits + type 5
        let first = Bytes::from_static(&[0x7c, 0x85, 0xaa, 0xbb]);
        let last = Bytes::from_static(&[0x7c, 0x45, 0xcc]);

        assert!(assembler.push(&first, false).unwrap().is_none());
        let au = assembler.push(&last, true).unwrap().unwrap();
        assert_eq!(au.as_ref(), annexb(&[&[0x65, 0xaa, 0xbb, 0xcc]]).as_slice());
    }

    #[test]
    fn empty_payloads_are_ignored() {
        let mut assembler = AccessUnitAssembler::new();
        assert!(assembler.push(&Bytes::new(), true).unwrap().is_none());
    }

    #[test]
    fn marker_without_data_emits_nothing() {
        let mut assembler = AccessUnitAssembler::new();
        let first = Bytes::from_static(&[0x7c, 0x85, 0xaa]);
        assert!(assembler.push(&first, true).unwrap().is_none());
    }
}
