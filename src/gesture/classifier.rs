use serde::{Deserialize, Serialize};
use std::fmt;

use super::features::FeatureVector;

/// 識別できるジェスチャーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GestureLabel {
    Tap,
    ScrollUp,
    ScrollDown,
    SwipeLeft,
    SwipeRight,
    CursorToggle,
    TapAtCursor,
    Return,
}

impl GestureLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::ScrollUp => "scroll_up",
            Self::ScrollDown => "scroll_down",
            Self::SwipeLeft => "swipe_left",
            Self::SwipeRight => "swipe_right",
            Self::CursorToggle => "cursor",
            Self::TapAtCursor => "tap_at_cursor",
            Self::Return => "return",
        }
    }

    /// スクロールとスワイプは動きのジェスチャー（安定待ちなし）
    pub fn is_motion(self) -> bool {
        matches!(
            self,
            Self::ScrollUp | Self::ScrollDown | Self::SwipeLeft | Self::SwipeRight
        )
    }
}

impl fmt::Display for GestureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Rule {
    label: GestureLabel,
    matches: fn(&FeatureVector) -> bool,
}

/// 上から順に評価し、最初に一致した規則を採用する
const DISCRETE_RULES: &[Rule] = &[
    Rule {
        label: GestureLabel::ScrollUp,
        matches: |f| f.extended_count == 0,
    },
    Rule {
        label: GestureLabel::Tap,
        matches: |f| f.index && f.extended_count == 1,
    },
    Rule {
        label: GestureLabel::Return,
        matches: |f| f.thumb && f.extended_count == 1,
    },
    Rule {
        label: GestureLabel::SwipeRight,
        matches: |f| f.index && f.middle && !f.ring && !f.pinky,
    },
    Rule {
        label: GestureLabel::SwipeLeft,
        matches: |f| f.index && f.middle && f.ring && !f.pinky,
    },
    Rule {
        label: GestureLabel::CursorToggle,
        matches: |f| f.pinky && f.extended_count == 1,
    },
    Rule {
        label: GestureLabel::ScrollDown,
        matches: |f| f.extended_count >= 4,
    },
];

/// ポインタモードではタップと解除だけを見る
const POINTER_RULES: &[Rule] = &[
    Rule {
        label: GestureLabel::TapAtCursor,
        matches: |f| f.extended_count == 0,
    },
    Rule {
        label: GestureLabel::CursorToggle,
        matches: |f| f.pinky && f.extended_count == 1,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSet {
    Discrete,
    Pointer,
}

impl RuleSet {
    fn rules(self) -> &'static [Rule] {
        match self {
            Self::Discrete => DISCRETE_RULES,
            Self::Pointer => POINTER_RULES,
        }
    }
}

pub fn classify(features: &FeatureVector, rules: RuleSet) -> Option<GestureLabel> {
    rules
        .rules()
        .iter()
        .find(|rule| (rule.matches)(features))
        .map(|rule| rule.label)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(thumb: bool, index: bool, middle: bool, ring: bool, pinky: bool) -> FeatureVector {
        FeatureVector::from_fingers(thumb, index, middle, ring, pinky)
    }

    fn discrete(f: FeatureVector) -> Option<GestureLabel> {
        classify(&f, RuleSet::Discrete)
    }

    #[test]
    fn test_discrete_table() {
        use GestureLabel::*;
        assert_eq!(discrete(fv(false, false, false, false, false)), Some(ScrollUp));
        assert_eq!(discrete(fv(false, true, false, false, false)), Some(Tap));
        assert_eq!(discrete(fv(true, false, false, false, false)), Some(Return));
        assert_eq!(discrete(fv(false, true, true, false, false)), Some(SwipeRight));
        assert_eq!(discrete(fv(false, true, true, true, false)), Some(SwipeLeft));
        assert_eq!(discrete(fv(false, false, false, false, true)), Some(CursorToggle));
        assert_eq!(discrete(fv(false, true, true, true, true)), Some(ScrollDown));
        assert_eq!(discrete(fv(true, true, true, true, true)), Some(ScrollDown));
    }

    #[test]
    fn test_priority_order() {
        // 親指 + 人差し指 + 中指 は SwipeRight の規則に先に一致する
        assert_eq!(
            discrete(fv(true, true, true, false, false)),
            Some(GestureLabel::SwipeRight)
        );
        // 親指 + 人差し指 + 中指 + 薬指 は 4 本だが SwipeLeft が先
        assert_eq!(
            discrete(fv(true, true, true, true, false)),
            Some(GestureLabel::SwipeLeft)
        );
    }

    #[test]
    fn test_unmatched_is_none() {
        assert_eq!(discrete(fv(false, false, true, false, false)), None);
        assert_eq!(discrete(fv(true, true, false, false, false)), None);
        assert_eq!(discrete(fv(false, true, false, false, true)), None);
    }

    #[test]
    fn test_pointer_table() {
        let pointer = |f| classify(&f, RuleSet::Pointer);
        assert_eq!(pointer(fv(false, false, false, false, false)), Some(GestureLabel::TapAtCursor));
        assert_eq!(pointer(fv(false, false, false, false, true)), Some(GestureLabel::CursorToggle));
        assert_eq!(pointer(fv(false, true, false, false, false)), None);
        assert_eq!(pointer(fv(true, true, true, true, true)), None);
    }

    #[test]
    fn test_label_strings() {
        assert_eq!(GestureLabel::CursorToggle.as_str(), "cursor");
        assert_eq!(GestureLabel::ScrollUp.to_string(), "scroll_up");
        assert!(GestureLabel::SwipeLeft.is_motion());
        assert!(!GestureLabel::Tap.is_motion());
        assert!(!GestureLabel::TapAtCursor.is_motion());
    }
}
