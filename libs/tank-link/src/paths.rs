//! Keys shared with the vehicle through the realtime store.

pub const SENSOR_DISTANCE: &str = "sensor/distance";
pub const AUTONOMOUS: &str = "commands/autonomous";
pub const FIRE: &str = "commands/fire";
pub const MOVEMENT_SPEED: &str = "commands/movement/speed";
pub const MOVEMENT_ANGLE: &str = "commands/movement/angle";
pub const LATEST_PHOTO: &str = "photos/latest/photo";
pub const LATEST_META: &str = "photos/latest/meta";
pub const HISTORY: &str = "history";
pub const CAMERA_IP: &str = "esp32camip";

pub fn history_entry(id: &str) -> String {
    format!("{HISTORY}/{id}")
}

/// Splits a slash separated path into its segments, ignoring leading,
/// trailing and repeated slashes.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Canonical form of `path`, used as the subscription key.
pub fn normalize(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

/// True when one path is an ancestor of (or equal to) the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    segments(a).zip(segments(b)).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slashes() {
        assert_eq!(normalize("/commands//fire/"), "commands/fire");
        assert_eq!(normalize("/"), "");
    }

    #[test]
    fn overlap_is_segment_wise() {
        assert!(overlaps("commands", "commands/fire"));
        assert!(overlaps("commands/fire", "commands"));
        assert!(overlaps("", "history/abc"));
        assert!(!overlaps("commands/fire", "commands/firework"));
        assert!(!overlaps("photos/latest/photo", "photos/latest/meta"));
    }
}
