//! Touch coordinate mapping and contact-slot bookkeeping.
//!
//! The session's dispatch calls into these synchronously: incoming pointer
//! coordinates are in the remote screen's pixel space and must land inside
//! the host monitor rectangle assigned to the device, honouring the
//! device's rotation.

// MARK: - TargetRect

/// Host monitor area (virtual desktop coordinates) touches are mapped into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl TargetRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }
}

// MARK: - TouchMapper

/// Maps remote-screen pixel coordinates into a host monitor rectangle.
///
/// `rotation_degrees` must be one of 0, 90, 180, 270; other values are
/// treated as 0.
#[derive(Debug, Clone)]
pub struct TouchMapper {
    source_w: u32,
    source_h: u32,
    target: TargetRect,
    rotation_degrees: u32,
}

impl TouchMapper {
    pub fn new(source_w: u32, source_h: u32, target: TargetRect, rotation_degrees: u32) -> Self {
        Self { source_w: source_w.max(2), source_h: source_h.max(2), target, rotation_degrees }
    }

    /// Update the peer screen dimensions (learned from the handshake).
    pub fn set_source(&mut self, width: u32, height: u32) {
        self.source_w = width.max(2);
        self.source_h = height.max(2);
    }

    pub fn set_target(&mut self, target: TargetRect) {
        self.target = target;
    }

    pub fn set_rotation(&mut self, degrees: u32) {
        self.rotation_degrees = degrees % 360;
    }

    /// Map `(px, py)` from remote pixels to host coordinates.
    ///
    /// Normalise to [0,1], rotate about the centre, then scale + translate
    /// into the target rectangle.
    pub fn map(&self, px: f64, py: f64) -> (f64, f64) {
        let nx = px / (self.source_w - 1) as f64;
        let ny = py / (self.source_h - 1) as f64;

        let (rx, ry) = match self.rotation_degrees {
            90 => (1.0 - ny, nx),
            180 => (1.0 - nx, 1.0 - ny),
            270 => (ny, 1.0 - nx),
            _ => (nx, ny),
        };

        (self.target.x + rx * self.target.width, self.target.y + ry * self.target.height)
    }
}

// MARK: - SlotRegistry

/// Assigns stable contact slots to remote pointer ids.
///
/// The platform injector wants a small dense slot index per simultaneous
/// contact; remote pointer ids are arbitrary. Smallest free slot wins.
#[derive(Debug)]
pub struct SlotRegistry {
    slots: Vec<Option<u32>>,
}

impl SlotRegistry {
    pub fn new(max_contacts: usize) -> Self {
        Self { slots: vec![None; max_contacts.max(1)] }
    }

    /// Slot for `pointer_id`, allocating the smallest free one if new.
    /// `None` when every slot is occupied by another pointer.
    pub fn allocate(&mut self, pointer_id: u32) -> Option<u32> {
        if let Some(existing) = self.lookup(pointer_id) {
            return Some(existing);
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(pointer_id);
                return Some(i as u32);
            }
        }
        None
    }

    pub fn lookup(&self, pointer_id: u32) -> Option<u32> {
        self.slots.iter().position(|s| *s == Some(pointer_id)).map(|i| i as u32)
    }

    /// Free the slot held by `pointer_id`, returning it if it was occupied.
    pub fn release(&mut self, pointer_id: u32) -> Option<u32> {
        let idx = self.slots.iter().position(|s| *s == Some(pointer_id))?;
        self.slots[idx] = None;
        Some(idx as u32)
    }

    /// Lowest occupied slot, used as the primary contact.
    pub fn primary_slot(&self) -> Option<u32> {
        self.slots.iter().position(|s| s.is_some()).map(|i| i as u32)
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
