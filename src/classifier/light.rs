//! 信号機の状態

use serde::{Deserialize, Serialize};

/// 信号機の状態
///
/// 数値はROSの `styx_msgs/TrafficLight` と同じです（3は欠番）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrafficLight {
    Red = 0,
    Yellow = 1,
    Green = 2,
    Unknown = 4,
}

impl TrafficLight {
    /// ROSメッセージ用の数値
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// 全画面分類器の出力クラス（0..=3）から変換
    ///
    /// 3（不明）と範囲外はすべて `Unknown` になります。
    pub fn from_class_index(index: usize) -> Self {
        match index {
            0 => TrafficLight::Red,
            1 => TrafficLight::Yellow,
            2 => TrafficLight::Green,
            _ => TrafficLight::Unknown,
        }
    }
}

impl std::fmt::Display for TrafficLight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrafficLight::Red => write!(f, "RED"),
            TrafficLight::Yellow => write!(f, "YELLOW"),
            TrafficLight::Green => write!(f, "GREEN"),
            TrafficLight::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ros_values() {
        assert_eq!(TrafficLight::Red.as_u8(), 0);
        assert_eq!(TrafficLight::Yellow.as_u8(), 1);
        assert_eq!(TrafficLight::Green.as_u8(), 2);
        assert_eq!(TrafficLight::Unknown.as_u8(), 4);
    }

    #[test]
    fn test_from_class_index() {
        assert_eq!(TrafficLight::from_class_index(0), TrafficLight::Red);
        assert_eq!(TrafficLight::from_class_index(2), TrafficLight::Green);
        assert_eq!(TrafficLight::from_class_index(3), TrafficLight::Unknown);
        assert_eq!(TrafficLight::from_class_index(17), TrafficLight::Unknown);
    }

    #[test]
    fn test_display() {
        assert_eq!(TrafficLight::Yellow.to_string(), "YELLOW");
        assert_eq!(TrafficLight::Unknown.to_string(), "UNKNOWN");
    }
}
