/// Axis-aligned box in pixels, described by its center.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    /// Build from corner coordinates (`x1, y1, x2, y2`), the layout most
    /// detector heads emit.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            cx: x1 + (x2 - x1) / 2.0,
            cy: y1 + (y2 - y1) / 2.0,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.cx.is_finite() && self.cy.is_finite() && self.w.is_finite() && self.h.is_finite()
    }
}

/// One inference result at the pipeline boundary.
///
/// Backends return boxes in the coordinates of the frame they were given; the
/// pipeline shifts them into source space by the ROI offset.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_name: String,
    /// Numeric class code from the model head, when the backend has one.
    pub class_id: Option<u32>,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_name: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            class_name: class_name.into(),
            class_id: None,
            confidence,
        }
    }

    pub fn with_class_id(mut self, class_id: u32) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn centroid(&self) -> (f32, f32) {
        (self.bbox.cx, self.bbox.cy)
    }

    /// Shift into the parent frame's coordinates.
    pub fn offset_by(mut self, dx: f32, dy: f32) -> Self {
        self.bbox.cx += dx;
        self.bbox.cy += dy;
        self
    }

    /// Usable for tracking: finite geometry, finite confidence, a class label.
    pub fn is_well_formed(&self) -> bool {
        self.bbox.is_finite() && self.confidence.is_finite() && !self.class_name.trim().is_empty()
    }
}
