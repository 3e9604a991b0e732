use ffmpeg_next::codec::{self, Id};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::util::frame::Video;
use once_cell::sync::OnceCell;

use crate::frame::{DecodedFrame, PixelFormat};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to initialize FFmpeg: {0}")]
    Init(ffmpeg_next::Error),
    #[error("FFmpeg has no H.264 decoder")]
    DecoderNotFound,
    #[error("failed to open H.264 decoder: {0}")]
    Open(ffmpeg_next::Error),
    #[error("decoder rejected packet: {0}")]
    SendPacket(ffmpeg_next::Error),
    #[error("decoder failed: {0}")]
    ReceiveFrame(ffmpeg_next::Error),
    #[error("failed to convert frame to {0:?}: {1}")]
    Convert(Pixel, ffmpeg_next::Error),
}

/// Initializes FFmpeg once per process and silences everything below fatal.
pub fn init_ffmpeg() -> Result<(), DecodeError> {
    static INIT: OnceCell<Result<(), ffmpeg_next::Error>> = OnceCell::new();
    INIT.get_or_init(|| {
        ffmpeg_next::init()?;
        ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Fatal);
        Ok(())
    })
    .clone()
    .map_err(DecodeError::Init)
}

struct Converter {
    context: scaling::Context,
    input: (Pixel, u32, u32),
}

/// FFmpeg H.264 decoder producing packed BGR24 frames.
pub struct H264Decoder {
    decoder: ffmpeg_next::decoder::Video,
    decoded: Video,
    converted: Video,
    converter: Option<Converter>,
}

impl H264Decoder {
    pub fn new() -> Result<Self, DecodeError> {
        init_ffmpeg()?;
        let codec =
            ffmpeg_next::decoder::find(Id::H264).ok_or(DecodeError::DecoderNotFound)?;
        let decoder = codec::context::Context::new_with_codec(codec)
            .decoder()
            .video()
            .map_err(DecodeError::Open)?;
        info!("initialized FFmpeg H.264 decoder");
        Ok(Self {
            decoder,
            decoded: Video::empty(),
            converted: Video::empty(),
            converter: None,
        })
    }

    /// Decodes one Annex B access unit and hands every produced frame to
    /// `on_frame`. The frame's pixels are only borrowed for that call.
    ///
    /// Returns the number of frames produced.
    pub fn decode<F>(
        &mut self,
        access_unit: &[u8],
        mut on_frame: F,
    ) -> Result<usize, DecodeError>
    where
        F: FnMut(&DecodedFrame<'_>),
    {
        let packet = ffmpeg_next::Packet::copy(access_unit);
        self.decoder
            .send_packet(&packet)
            .map_err(DecodeError::SendPacket)?;

        let mut produced = 0;
        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other {
                    errno: ffmpeg_next::error::EAGAIN,
                }) => break,
                Err(e) => return Err(DecodeError::ReceiveFrame(e)),
            }
            self.convert()?;
            let frame = DecodedFrame {
                data: self.converted.data(0),
                width: self.converted.width() as usize,
                height: self.converted.height() as usize,
                stride: self.converted.stride(0),
                format: PixelFormat::Bgr24,
            };
            trace!(width = frame.width, height = frame.height, "decoded frame");
            on_frame(&frame);
            produced += 1;
        }
        Ok(produced)
    }

    fn convert(&mut self) -> Result<(), DecodeError> {
        let input = (
            self.decoded.format(),
            self.decoded.width(),
            self.decoded.height(),
        );
        let stale = self
            .converter
            .as_ref()
            .map_or(true, |converter| converter.input != input);
        if stale {
            let (format, width, height) = input;
            let context = scaling::Context::get(
                format,
                width,
                height,
                Pixel::BGR24,
                width,
                height,
                Flags::BILINEAR,
            )
            .map_err(|e| DecodeError::Convert(Pixel::BGR24, e))?;
            debug!(?format, width, height, "created BGR24 converter");
            self.converter = Some(Converter { context, input });
        }
        if let Some(converter) = self.converter.as_mut() {
            converter
                .context
                .run(&self.decoded, &mut self.converted)
                .map_err(|e| DecodeError::Convert(Pixel::BGR24, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: [u8; 4] = [0, 0, 0, 1];
    // Baseline, POC type 2, one macroblock high.
    const SPS_1_MB: [u8; 6] = [0x67, 0x42, 0xc0, 0x1e, 0xda, 0x79];
    const SPS_2_MB: [u8; 7] = [0x67, 0x42, 0xc0, 0x1e, 0xda, 0x2e, 0x40];
    const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];
    // IDR slice header up to the byte-aligned I_PCM samples of the first
    // macroblock.
    const IDR_HEADER: [u8; 5] = [0x65, 0x88, 0x84, 0x86, 0x80];
    // mb_type I_PCM plus alignment for every further macroblock.
    const NEXT_PCM_MB: [u8; 2] = [0x0d, 0x00];
    const PCM_SAMPLES: usize = 256 + 2 * 64;
    const MID_GREY: u8 = 0x80;

    /// SPS + PPS + IDR for a mid-grey picture `16 * width_mbs` by 16 pixels,
    /// coded as raw I_PCM macroblocks.
    fn grey_access_unit(width_mbs: usize) -> Vec<u8> {
        let sps: &[u8] = match width_mbs {
            1 => &SPS_1_MB,
            2 => &SPS_2_MB,
            _ => unreachable!(),
        };
        let mut idr = IDR_HEADER.to_vec();
        for mb in 0..width_mbs {
            if mb > 0 {
                idr.extend_from_slice(&NEXT_PCM_MB);
            }
            idr.extend(std::iter::repeat(MID_GREY).take(PCM_SAMPLES));
        }
        // rbsp stop bit
        idr.push(0x80);

        let nals: [&[u8]; 3] = [sps, &PPS, &idr];
        nals.iter()
            .flat_map(|nal| START.iter().chain(nal.iter()).copied())
            .collect()
    }

    struct Seen {
        width: usize,
        height: usize,
        stride_ok: bool,
        valid: bool,
        grey: bool,
    }

    fn decode_all(decoder: &mut H264Decoder, access_units: &[Vec<u8>]) -> Vec<Seen> {
        let mut seen = Vec::new();
        for au in access_units {
            decoder
                .decode(au, |frame| {
                    let row_len = frame.width * frame.format.bytes_per_pixel();
                    seen.push(Seen {
                        width: frame.width,
                        height: frame.height,
                        stride_ok: frame.stride >= row_len,
                        valid: frame.validate().is_ok(),
                        grey: frame.data[..row_len]
                            .iter()
                            .all(|&v| (112..=144).contains(&v)),
                    });
                })
                .unwrap();
        }
        seen
    }

    #[test]
    fn idr_access_unit_decodes_to_bgr_frame() {
        let mut decoder = H264Decoder::new().unwrap();
        // Repeated so a decoder holding back one picture still emits one.
        let au = grey_access_unit(1);
        let seen = decode_all(&mut decoder, &[au.clone(), au.clone(), au]);

        assert!(!seen.is_empty());
        for frame in &seen {
            assert_eq!((frame.width, frame.height), (16, 16));
            assert!(frame.stride_ok);
            assert!(frame.valid);
            assert!(frame.grey);
        }
    }

    #[test]
    fn converter_follows_resolution_change() {
        let mut decoder = H264Decoder::new().unwrap();
        let small = grey_access_unit(1);
        let wide = grey_access_unit(2);
        let seen = decode_all(
            &mut decoder,
            &[small.clone(), small, wide.clone(), wide.clone(), wide],
        );

        let sizes: Vec<_> = seen.iter().map(|f| (f.width, f.height)).collect();
        assert!(sizes.contains(&(16, 16)), "{sizes:?}");
        assert_eq!(sizes.last(), Some(&(32, 16)), "{sizes:?}");
        assert!(seen.iter().all(|f| f.stride_ok && f.valid && f.grey));
    }

    #[test]
    fn ffmpeg_init_is_idempotent() {
        init_ffmpeg().unwrap();
        init_ffmpeg().unwrap();
    }

    #[test]
    fn garbage_produces_no_frames() {
        let mut decoder = H264Decoder::new().unwrap();
        let mut seen = 0;
        // A lone access unit delimiter cannot produce a picture.
        let result = decoder.decode(&[0, 0, 0, 1, 0x09, 0xf0], |_| seen += 1);
        assert!(matches!(result, Ok(0) | Err(DecodeError::SendPacket(_))));
        assert_eq!(seen, 0);
    }
}
