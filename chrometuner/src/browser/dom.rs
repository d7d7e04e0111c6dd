//! Element geometry and descriptions returned by page scripts.

use serde::{Deserialize, Serialize};

/// Roles that mark an element as explicitly interactive.
const INTERACTIVE_ROLES: &[&str] = &[
    "button", "link", "menuitem", "option", "tab", "checkbox", "radio", "switch",
];

/// A point in viewport (CSS pixel) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An element's bounding client rect.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }

    /// Intersection with another box, or `None` if they do not overlap.
    pub fn intersect(&self, other: &ElementBox) -> Option<ElementBox> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        if right <= left || bottom <= top {
            return None;
        }
        Some(ElementBox::new(left, top, right - left, bottom - top))
    }
}

/// One ancestor of a matching tile image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AncestorInfo {
    /// Lowercase tag name.
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Inline `onclick` attribute or handler property.
    #[serde(default)]
    pub has_click_handler: bool,
    /// Computed `cursor` style.
    #[serde(default)]
    pub cursor: String,
    pub rect: ElementBox,
}

impl AncestorInfo {
    /// Link, button, interactive role, or inline click handler.
    pub fn is_semantic_clickable(&self) -> bool {
        if self.tag == "a" || self.tag == "button" || self.has_click_handler {
            return true;
        }
        self.role
            .as_deref()
            .map(|role| INTERACTIVE_ROLES.contains(&role.trim().to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Pointer cursor and at least `min_size` pixels in both dimensions.
    pub fn is_pointer_target(&self, min_size: f64) -> bool {
        self.cursor == "pointer" && self.rect.width >= min_size && self.rect.height >= min_size
    }
}

/// A matching tile image and its ancestors, nearest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TileCandidate {
    pub ancestors: Vec<AncestorInfo>,
}

/// How a click target was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Semantic,
    Fallback,
}

/// Reference to an ancestor of the `tile`-th matching image.
///
/// `depth` 0 is the image's parent element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub tile: usize,
    pub depth: usize,
    pub kind: TargetKind,
}

/// An element box together with the viewport it was measured in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleBox {
    pub rect: ElementBox,
    pub viewport_width: f64,
    pub viewport_height: f64,
}

impl VisibleBox {
    /// Center of the part of the box inside the viewport.
    pub fn visible_center(&self) -> Option<Point> {
        let viewport = ElementBox::new(0.0, 0.0, self.viewport_width, self.viewport_height);
        self.rect.intersect(&viewport).map(|visible| visible.center())
    }
}

/// HTMLMediaElement `readyState` value meaning enough data to play ahead.
pub const HAVE_FUTURE_DATA: u8 = 3;

/// Minimum playback position that counts as "actually playing".
pub const PLAYBACK_THRESHOLD_SECS: f64 = 0.5;

/// Snapshot of a page's first video element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoState {
    pub ready_state: u8,
    pub current_time: f64,
}

impl VideoState {
    /// Buffered enough and advanced past the threshold.
    pub fn is_playing(&self) -> bool {
        self.ready_state >= HAVE_FUTURE_DATA && self.current_time > PLAYBACK_THRESHOLD_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ancestor(tag: &str, cursor: &str, rect: ElementBox) -> AncestorInfo {
        AncestorInfo {
            tag: tag.to_string(),
            role: None,
            has_click_handler: false,
            cursor: cursor.to_string(),
            rect,
        }
    }

    #[test]
    fn test_semantic_clickable() {
        let rect = ElementBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(ancestor("a", "auto", rect).is_semantic_clickable());
        assert!(ancestor("button", "auto", rect).is_semantic_clickable());
        assert!(!ancestor("div", "pointer", rect).is_semantic_clickable());

        let mut role = ancestor("div", "auto", rect);
        role.role = Some("Button".to_string());
        assert!(role.is_semantic_clickable());

        let mut handler = ancestor("span", "auto", rect);
        handler.has_click_handler = true;
        assert!(handler.is_semantic_clickable());
    }

    #[test]
    fn test_pointer_target_size() {
        let small = ancestor("div", "pointer", ElementBox::new(0.0, 0.0, 10.0, 50.0));
        let big = ancestor("div", "pointer", ElementBox::new(0.0, 0.0, 50.0, 50.0));
        let no_cursor = ancestor("div", "default", ElementBox::new(0.0, 0.0, 50.0, 50.0));
        assert!(!small.is_pointer_target(20.0));
        assert!(big.is_pointer_target(20.0));
        assert!(!no_cursor.is_pointer_target(20.0));
    }

    #[test]
    fn test_visible_center_clips_to_viewport() {
        let partly_below = VisibleBox {
            rect: ElementBox::new(100.0, 600.0, 200.0, 200.0),
            viewport_width: 1280.0,
            viewport_height: 720.0,
        };
        assert_eq!(partly_below.visible_center(), Some(Point { x: 200.0, y: 660.0 }));

        let offscreen = VisibleBox {
            rect: ElementBox::new(100.0, 900.0, 200.0, 200.0),
            viewport_width: 1280.0,
            viewport_height: 720.0,
        };
        assert_eq!(offscreen.visible_center(), None);
    }

    #[test]
    fn test_video_state_playing() {
        assert!(!VideoState { ready_state: 4, current_time: 0.2 }.is_playing());
        assert!(!VideoState { ready_state: 2, current_time: 3.0 }.is_playing());
        assert!(VideoState { ready_state: 3, current_time: 0.6 }.is_playing());
    }

    #[test]
    fn test_tile_candidate_deserialize() {
        let json = r#"{"ancestors":[{"tag":"a","role":null,"hasClickHandler":false,"cursor":"pointer","rect":{"x":1,"y":2,"width":3,"height":4}}]}"#;
        let tile: TileCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(tile.ancestors[0].tag, "a");
        assert_eq!(tile.ancestors[0].rect.height, 4.0);
    }
}
