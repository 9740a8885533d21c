use crate::config::FeatureConfig;
use crate::error::ExtractError;
use crate::pose::landmark::{HandLandmark, HandPose, Landmark};

/// 1フレーム分の手の特徴量
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeatureVector {
    pub thumb: bool,
    pub index: bool,
    pub middle: bool,
    pub ring: bool,
    pub pinky: bool,
    /// 伸びている指の数（親指を含む）
    pub extended_count: u8,
    /// 手首と4本の指の付け根の重心
    pub palm: (f32, f32),
}

impl FeatureVector {
    /// 親指から小指の順
    pub fn from_fingers(thumb: bool, index: bool, middle: bool, ring: bool, pinky: bool) -> Self {
        let extended_count = [thumb, index, middle, ring, pinky]
            .iter()
            .filter(|&&f| f)
            .count() as u8;
        Self {
            thumb,
            index,
            middle,
            ring,
            pinky,
            extended_count,
            palm: (0.0, 0.0),
        }
    }
}

/// 指の付け根 (MCP) と指先の組
const FINGERS: [(HandLandmark, HandLandmark); 4] = [
    (HandLandmark::IndexMcp, HandLandmark::IndexTip),
    (HandLandmark::MiddleMcp, HandLandmark::MiddleTip),
    (HandLandmark::RingMcp, HandLandmark::RingTip),
    (HandLandmark::PinkyMcp, HandLandmark::PinkyTip),
];

const PALM: [HandLandmark; 5] = [
    HandLandmark::Wrist,
    HandLandmark::IndexMcp,
    HandLandmark::MiddleMcp,
    HandLandmark::RingMcp,
    HandLandmark::PinkyMcp,
];

/// ランドマークから特徴量を求める（状態を持たない）
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    finger_threshold: f32,
    thumb_threshold: f32,
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            finger_threshold: config.finger_threshold,
            thumb_threshold: config.thumb_threshold,
        }
    }

    pub fn extract(&self, pose: &HandPose) -> Result<FeatureVector, ExtractError> {
        let lm = &pose.landmarks;
        if lm.len() < HandLandmark::COUNT {
            return Err(ExtractError::InsufficientLandmarks {
                expected: HandLandmark::COUNT,
                found: lm.len(),
            });
        }
        let at = |i: HandLandmark| lm[i as usize];

        // Y は下向きなので、指先が付け根より上にあれば base.y - tip.y が正
        let [index, middle, ring, pinky] =
            FINGERS.map(|(base, tip)| at(base).y - at(tip).y > self.finger_threshold);

        let wrist = at(HandLandmark::Wrist);
        let thumb_reach = (at(HandLandmark::ThumbTip).x - wrist.x).abs();
        let knuckle_reach = (at(HandLandmark::IndexMcp).x - wrist.x).abs();
        let thumb = thumb_reach > knuckle_reach + self.thumb_threshold;

        let mut features = FeatureVector::from_fingers(thumb, index, middle, ring, pinky);
        features.palm = palm_center(PALM.map(at));
        Ok(features)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(&FeatureConfig::default())
    }
}

fn palm_center(points: [Landmark; 5]) -> (f32, f32) {
    let n = points.len() as f32;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    (sx / n, sy / n)
}
