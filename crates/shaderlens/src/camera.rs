use renderer::{FrameImage, InputFrame, Mat4, Size};

const FRAME_INTERVAL_NS: i64 = 33_333_333;

/// Pixel layout the synthetic camera produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraFormat {
    Rgba8,
    /// 10-bit limited-range YUV, as an HDR camera delivers it.
    P010,
}

/// Produces a moving colour-bar pattern.
#[derive(Debug)]
pub struct SyntheticCamera {
    size: Size,
    format: CameraFormat,
}

impl SyntheticCamera {
    pub fn new(size: Size, format: CameraFormat) -> Self {
        Self { size, format }
    }

    pub fn frame(&self, index: u32) -> InputFrame {
        let image = match self.format {
            CameraFormat::Rgba8 => self.rgba(index),
            CameraFormat::P010 => self.p010(index),
        };
        InputFrame {
            timestamp_ns: i64::from(index) * FRAME_INTERVAL_NS,
            // Uploaded rows run top to bottom; the quad's v axis runs up.
            transform: Mat4::vertical_flip(),
            image,
        }
    }

    fn color_at(&self, x: u32, y: u32, index: u32) -> [f32; 3] {
        const BARS: [[f32; 3]; 7] = [
            [0.75, 0.75, 0.75],
            [0.75, 0.75, 0.0],
            [0.0, 0.75, 0.75],
            [0.0, 0.75, 0.0],
            [0.75, 0.0, 0.75],
            [0.75, 0.0, 0.0],
            [0.0, 0.0, 0.75],
        ];
        let shifted = (x + index * 4) % self.size.width.max(1);
        let bar = (shifted as usize * BARS.len()) / self.size.width.max(1) as usize;
        let shade = 0.5 + 0.5 * (y as f32 / self.size.height.max(1) as f32);
        BARS[bar.min(BARS.len() - 1)].map(|channel| channel * shade)
    }

    fn rgba(&self, index: u32) -> FrameImage {
        let Size { width, height } = self.size;
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let [r, g, b] = self.color_at(x, y, index);
                data.extend_from_slice(&[to_u8(r), to_u8(g), to_u8(b), 255]);
            }
        }
        FrameImage::Rgba8 {
            size: self.size,
            data,
        }
    }

    fn p010(&self, index: u32) -> FrameImage {
        let Size { width, height } = self.size;
        let mut y_plane = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let [luma, _, _] = rgb_to_yuv(self.color_at(x, y, index));
                y_plane.push(to_p010(luma));
            }
        }
        let (chroma_w, chroma_h) = (width.div_ceil(2), height.div_ceil(2));
        let mut uv_plane = Vec::with_capacity(chroma_w as usize * chroma_h as usize * 2);
        for y in 0..chroma_h {
            for x in 0..chroma_w {
                let [_, u, v] = rgb_to_yuv(self.color_at(x * 2, y * 2, index));
                uv_plane.push(to_p010(u));
                uv_plane.push(to_p010(v));
            }
        }
        FrameImage::P010 {
            size: self.size,
            y: y_plane,
            uv: uv_plane,
        }
    }
}

fn to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// 10-bit code value in the high bits of a 16-bit word.
fn to_p010(value: f32) -> u16 {
    ((value.clamp(0.0, 1.0) * 1023.0).round() as u16) << 6
}

/// Limited-range BT.2020 encoding, normalised to 0..1.
fn rgb_to_yuv([r, g, b]: [f32; 3]) -> [f32; 3] {
    let y = 0.2627 * r + 0.6780 * g + 0.0593 * b;
    let u = (b - y) / 1.8814;
    let v = (r - y) / 1.4746;
    [
        16.0 / 255.0 + y * 219.0 / 255.0,
        0.5 + u * 224.0 / 255.0,
        0.5 + v * 224.0 / 255.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_frames_fill_the_image() {
        let camera = SyntheticCamera::new(Size::new(14, 3), CameraFormat::Rgba8);
        let frame = camera.frame(2);
        assert_eq!(frame.timestamp_ns, 2 * FRAME_INTERVAL_NS);
        let FrameImage::Rgba8 { data, .. } = frame.image else {
            panic!("expected rgba");
        };
        assert_eq!(data.len(), 14 * 3 * 4);
        assert!(data.chunks(4).all(|pixel| pixel[3] == 255));
    }

    #[test]
    fn p010_planes_use_high_bits() {
        let camera = SyntheticCamera::new(Size::new(5, 3), CameraFormat::P010);
        let FrameImage::P010 { y, uv, .. } = camera.frame(0).image else {
            panic!("expected p010");
        };
        assert_eq!(y.len(), 15);
        assert_eq!(uv.len(), 3 * 2 * 2);
        assert!(y.iter().chain(uv.iter()).all(|sample| sample & 0x3f == 0));
    }

    #[test]
    fn pattern_moves_between_frames() {
        let camera = SyntheticCamera::new(Size::new(28, 1), CameraFormat::Rgba8);
        assert_ne!(camera.frame(0).image, camera.frame(1).image);
    }

    #[test]
    fn black_encodes_to_limited_range_floor() {
        let [y, u, v] = rgb_to_yuv([0.0, 0.0, 0.0]);
        assert!((y - 16.0 / 255.0).abs() < 1e-6);
        assert!((u - 0.5).abs() < 1e-6);
        assert!((v - 0.5).abs() < 1e-6);
    }
}
