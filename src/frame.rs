use std::fmt;

/// Pixel layouts the snapshot pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 24-bit blue-green-red, as produced by the decoder's scaler.
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr24 => 3,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Bgr24 => f.write_str("bgr24"),
        }
    }
}

/// A decoded frame borrowed from the decoder.
///
/// The pixel buffer is only valid for the duration of the callback that hands
/// the frame out; anything that needs the pixels later must call
/// [`DecodedFrame::to_owned_frame`].
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub data: &'a [u8],
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub format: PixelFormat,
}

impl<'a> DecodedFrame<'a> {
    pub fn validate(&self) -> Result<(), FrameError> {
        check_layout(
            self.data.len(),
            self.width,
            self.height,
            self.stride,
            self.format.bytes_per_pixel(),
        )
    }

    /// Copies the `height * stride` bytes that make up the frame.
    pub fn to_owned_frame(&self) -> Result<OwnedFrame, FrameError> {
        self.validate()?;
        Ok(OwnedFrame {
            data: self.data[..self.height * self.stride].to_vec(),
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
        })
    }
}

/// A frame whose pixels are owned by the snapshot pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub format: PixelFormat,
}

impl OwnedFrame {
    pub fn as_decoded(&self) -> DecodedFrame<'_> {
        DecodedFrame {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
        }
    }

    /// Rewrites a BGR24 frame into a tightly packed RGB24 buffer.
    pub fn into_rgb_packed(mut self) -> Result<Vec<u8>, FrameError> {
        swap_red_blue(&mut self.data, self.width, self.height, self.stride)?;
        let row_len = self.width * self.format.bytes_per_pixel();
        if row_len == self.stride {
            self.data.truncate(self.height * self.stride);
            return Ok(self.data);
        }
        let mut packed = Vec::with_capacity(row_len * self.height);
        for row in self.data.chunks_exact(self.stride).take(self.height) {
            packed.extend_from_slice(&row[..row_len]);
        }
        Ok(packed)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: usize, height: usize },
    #[error("stride {stride} is shorter than a row of {row_len} bytes")]
    StrideTooShort { stride: usize, row_len: usize },
    #[error("buffer holds {got} bytes, frame needs {expected}")]
    BufferTooShort { got: usize, expected: usize },
    #[error("frame layout {width}x{height} with stride {stride} overflows")]
    LayoutOverflow {
        width: usize,
        height: usize,
        stride: usize,
    },
}

fn check_layout(
    len: usize,
    width: usize,
    height: usize,
    stride: usize,
    bytes_per_pixel: usize,
) -> Result<(), FrameError> {
    if width == 0 || height == 0 {
        return Err(FrameError::EmptyDimensions { width, height });
    }
    let overflow = || FrameError::LayoutOverflow {
        width,
        height,
        stride,
    };
    let row_len = width.checked_mul(bytes_per_pixel).ok_or_else(overflow)?;
    if stride < row_len {
        return Err(FrameError::StrideTooShort { stride, row_len });
    }
    let expected = height.checked_mul(stride).ok_or_else(overflow)?;
    if len < expected {
        return Err(FrameError::BufferTooShort { got: len, expected });
    }
    Ok(())
}

/// Swaps the first and third byte of every pixel in a packed 3-byte layout,
/// turning BGR into RGB (and back).
///
/// Only the `width * 3` prefix of each of the `height` rows is touched; row
/// padding and anything past `height * stride` are left alone.
pub fn swap_red_blue(
    buf: &mut [u8],
    width: usize,
    height: usize,
    stride: usize,
) -> Result<(), FrameError> {
    check_layout(buf.len(), width, height, stride, 3)?;
    let row_len = width * 3;
    for row in buf[..height * stride].chunks_exact_mut(stride) {
        for pixel in row[..row_len].chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
    }
    Ok(())
}
