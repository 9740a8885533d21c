use serde::{Deserialize, Serialize};

/// 手の 21 ランドマークインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum HandLandmark {
    Wrist = 0,
    ThumbCmc = 1,
    ThumbMcp = 2,
    ThumbIp = 3,
    ThumbTip = 4,
    IndexMcp = 5,
    IndexPip = 6,
    IndexDip = 7,
    IndexTip = 8,
    MiddleMcp = 9,
    MiddlePip = 10,
    MiddleDip = 11,
    MiddleTip = 12,
    RingMcp = 13,
    RingPip = 14,
    RingDip = 15,
    RingTip = 16,
    PinkyMcp = 17,
    PinkyPip = 18,
    PinkyDip = 19,
    PinkyTip = 20,
}

impl HandLandmark {
    pub const COUNT: usize = 21;

    const ALL: [HandLandmark; Self::COUNT] = [
        Self::Wrist,
        Self::ThumbCmc,
        Self::ThumbMcp,
        Self::ThumbIp,
        Self::ThumbTip,
        Self::IndexMcp,
        Self::IndexPip,
        Self::IndexDip,
        Self::IndexTip,
        Self::MiddleMcp,
        Self::MiddlePip,
        Self::MiddleDip,
        Self::MiddleTip,
        Self::RingMcp,
        Self::RingPip,
        Self::RingDip,
        Self::RingTip,
        Self::PinkyMcp,
        Self::PinkyPip,
        Self::PinkyDip,
        Self::PinkyTip,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// 単一ランドマーク（画像に対する正規化座標、Y は下向き）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// 推論エンジンが返す1フレーム分の手の検出結果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HandPose {
    pub present: bool,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(default)]
    pub confidence: f32,
}

impl HandPose {
    /// 手が検出されなかったフレーム
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn detected(landmarks: Vec<Landmark>, confidence: f32) -> Self {
        Self {
            present: true,
            landmarks,
            confidence,
        }
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn get(&self, index: HandLandmark) -> Option<&Landmark> {
        self.landmarks.get(index as usize)
    }

    /// 存在しかつ信頼度が閾値以上か
    pub fn is_confident(&self, threshold: f32) -> bool {
        self.present && self.confidence >= threshold
    }
}
