//! Image and audio sample buffers
//!
//! Owned pixel/sample storage with the flag words hosts expect. The runtime
//! shares these behind `Arc`, so cloning a value that carries an image is a
//! refcount bump, and host-injected buffers are never freed by the runtime.

use serde::{Deserialize, Serialize};

pub const IMAGE_FLAG_NONE: u8 = 0;
/// Channel order is BGRA instead of RGBA.
pub const IMAGE_FLAG_BGRA: u8 = 1 << 0;
/// Alpha is premultiplied into the color channels.
pub const IMAGE_FLAG_PREMULTIPLIED_ALPHA: u8 = 1 << 1;
/// 16 bits per channel, integer.
pub const IMAGE_FLAG_16BIT_INT: u8 = 1 << 2;
/// 32 bits per channel, float.
pub const IMAGE_FLAG_32BIT_FLOAT: u8 = 1 << 3;

/// A packed pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub width: u16,
    pub height: u16,
    pub channels: u8,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(width: u16, height: u16, channels: u8, flags: u8, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            flags,
            data,
        }
    }

    /// Bytes per channel as encoded by the flag word.
    pub fn bytes_per_channel(&self) -> usize {
        if self.flags & IMAGE_FLAG_32BIT_FLOAT != 0 {
            4
        } else if self.flags & IMAGE_FLAG_16BIT_INT != 0 {
            2
        } else {
            1
        }
    }

    /// Expected buffer length for the header fields.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize * self.bytes_per_channel()
    }

    /// A buffer is well-formed when the data length matches the header.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

/// A block of float audio samples, interleaved by channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audio {
    /// 0 when unknown or not relevant.
    pub sample_rate: u32,
    pub frame_count: u16,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl Audio {
    pub fn new(sample_rate: u32, frame_count: u16, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            frame_count,
            channels,
            samples,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.frame_count as usize * self.channels as usize
    }

    pub fn is_well_formed(&self) -> bool {
        self.samples.len() == self.expected_len()
    }
}

// Sample buffers compare bitwise; audio equality is about identity of the
// recorded signal, not tolerance.
impl PartialEq for Audio {
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate
            && self.frame_count == other.frame_count
            && self.channels == other.channels
            && self.samples.len() == other.samples.len()
            && self
                .samples
                .iter()
                .zip(other.samples.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for Audio {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_bit_depth_flags() {
        let img8 = Image::new(2, 2, 4, IMAGE_FLAG_NONE, vec![0; 16]);
        assert_eq!(img8.bytes_per_channel(), 1);
        assert!(img8.is_well_formed());

        let img16 = Image::new(2, 2, 4, IMAGE_FLAG_16BIT_INT, vec![0; 32]);
        assert_eq!(img16.bytes_per_channel(), 2);
        assert!(img16.is_well_formed());

        let imgf = Image::new(2, 2, 1, IMAGE_FLAG_32BIT_FLOAT, vec![0; 16]);
        assert_eq!(imgf.bytes_per_channel(), 4);
        assert!(imgf.is_well_formed());
    }

    #[test]
    fn test_image_truncated_buffer() {
        let img = Image::new(4, 4, 4, IMAGE_FLAG_BGRA, vec![0; 10]);
        assert!(!img.is_well_formed());
    }

    #[test]
    fn test_audio_equality_is_bitwise() {
        let a = Audio::new(44100, 2, 1, vec![0.0, 1.0]);
        let b = Audio::new(44100, 2, 1, vec![-0.0, 1.0]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
