#[cfg(feature = "desktop")]
use ndarray::Array4;

use crate::camera::frame::{Frame, PixelFormat};
use crate::error::InferenceError;

/// 推論エンジンへ渡す RGB 画像（向き補正済み）
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbImage {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// カメラフレームをエンジンの期待する向きと画素形式に変換する
///
/// - Gray / BGR -> RGB
/// - 時計回りに `rotation` 度回転 (0, 90, 180, 270)
/// - `mirror` なら回転後に左右反転（前面カメラ）
pub fn orient(frame: &Frame, rotation: u16, mirror: bool) -> Result<RgbImage, InferenceError> {
    if frame.width == 0 || frame.height == 0 || !frame.is_well_formed() {
        return Err(InferenceError::InvalidInput(format!(
            "{}x{} {:?} frame with {} bytes",
            frame.width,
            frame.height,
            frame.format,
            frame.data.len()
        )));
    }

    let (w, h) = (frame.width as usize, frame.height as usize);
    let (dw, dh) = match rotation {
        0 | 180 => (w, h),
        90 | 270 => (h, w),
        r => {
            return Err(InferenceError::InvalidInput(format!(
                "unsupported rotation {}",
                r
            )))
        }
    };
    let ch = frame.format.channels();

    let mut data = Vec::with_capacity(dw * dh * 3);
    for dy in 0..dh {
        for dx in 0..dw {
            let x = if mirror { dw - 1 - dx } else { dx };
            let (sx, sy) = match rotation {
                0 => (x, dy),
                90 => (dy, h - 1 - x),
                180 => (w - 1 - x, h - 1 - dy),
                _ => (w - 1 - dy, x),
            };
            let i = (sy * w + sx) * ch;
            let px = &frame.data[i..i + ch];
            match frame.format {
                PixelFormat::Gray8 => data.extend_from_slice(&[px[0], px[0], px[0]]),
                PixelFormat::Rgb8 => data.extend_from_slice(px),
                PixelFormat::Bgr8 => data.extend_from_slice(&[px[2], px[1], px[0]]),
            }
        }
    }

    Ok(RgbImage {
        width: dw as u32,
        height: dh as u32,
        data,
    })
}

/// RGB 画像を手ランドマークモデルの入力テンソルに変換
///
/// - size x size に最近傍リサイズ
/// - [1, size, size, 3] の f32 テンソル (0.0-1.0)
#[cfg(feature = "desktop")]
pub fn to_input_tensor(image: &RgbImage, size: u32) -> Array4<f32> {
    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, s, s, 3));
    if image.width == 0 || image.height == 0 {
        return tensor;
    }

    for y in 0..s {
        let sy = (y * image.height as usize / s).min(image.height as usize - 1);
        for x in 0..s {
            let sx = (x * image.width as usize / s).min(image.width as usize - 1);
            let [r, g, b] = image.pixel(sx as u32, sy as u32);
            tensor[[0, y, x, 0]] = r as f32 / 255.0;
            tensor[[0, y, x, 1]] = g as f32 / 255.0;
            tensor[[0, y, x, 2]] = b as f32 / 255.0;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 3x2 のグレー画像。画素値は 10 * (y * 3 + x)
    fn gray_3x2() -> Frame {
        Frame::new(3, 2, PixelFormat::Gray8, vec![0, 10, 20, 30, 40, 50])
    }

    fn reds(img: &RgbImage) -> Vec<u8> {
        img.data.chunks(3).map(|p| p[0]).collect()
    }

    #[test]
    fn test_bgr_to_rgb() {
        let frame = Frame::new(1, 1, PixelFormat::Bgr8, vec![1, 2, 3]);
        let img = orient(&frame, 0, false).unwrap();
        assert_eq!(img.data, vec![3, 2, 1]);
    }

    #[test]
    fn test_identity() {
        let img = orient(&gray_3x2(), 0, false).unwrap();
        assert_eq!((img.width, img.height), (3, 2));
        assert_eq!(reds(&img), vec![0, 10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_rotate_90_clockwise() {
        let img = orient(&gray_3x2(), 90, false).unwrap();
        assert_eq!((img.width, img.height), (2, 3));
        // 元の左下が左上に来る
        assert_eq!(reds(&img), vec![30, 0, 40, 10, 50, 20]);
    }

    #[test]
    fn test_rotate_270_clockwise() {
        let img = orient(&gray_3x2(), 270, false).unwrap();
        assert_eq!((img.width, img.height), (2, 3));
        assert_eq!(reds(&img), vec![20, 50, 10, 40, 0, 30]);
    }

    #[test]
    fn test_rotate_180_and_mirror() {
        let img = orient(&gray_3x2(), 180, false).unwrap();
        assert_eq!(reds(&img), vec![50, 40, 30, 20, 10, 0]);
        let img = orient(&gray_3x2(), 0, true).unwrap();
        assert_eq!(reds(&img), vec![20, 10, 0, 50, 40, 30]);
    }

    #[test]
    fn test_front_camera_default() {
        let img = orient(&gray_3x2(), 270, true).unwrap();
        assert_eq!((img.width, img.height), (2, 3));
        assert_eq!(reds(&img), vec![50, 20, 40, 10, 30, 0]);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let frame = Frame::new(4, 4, PixelFormat::Rgb8, vec![0; 5]);
        assert!(matches!(
            orient(&frame, 0, false),
            Err(InferenceError::InvalidInput(_))
        ));
        assert!(orient(&gray_3x2(), 45, false).is_err());
    }

    #[cfg(feature = "desktop")]
    #[test]
    fn test_input_tensor_shape_and_range() {
        let img = RgbImage {
            width: 2,
            height: 1,
            data: vec![255, 0, 0, 0, 0, 255],
        };
        let t = to_input_tensor(&img, 4);
        assert_eq!(t.shape(), &[1, 4, 4, 3]);
        assert_eq!(t[[0, 0, 0, 0]], 1.0);
        assert_eq!(t[[0, 3, 3, 2]], 1.0);
        assert_eq!(t[[0, 3, 3, 0]], 0.0);
    }
}
