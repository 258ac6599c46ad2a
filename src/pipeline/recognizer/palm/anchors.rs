//! SSD anchors for the 192x192 palm detector.

pub const NUM_ANCHORS: usize = 2016;

const INPUT_SIZE: usize = 192;
const STRIDES: [usize; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;
const ANCHOR_OFFSET: f32 = 0.5;

/// Anchor centers `[cx, cy]` normalized to `[0, 1]`. Consecutive layers
/// sharing a stride are merged onto one grid, matching the detector's output
/// order.
pub fn generate_anchors() -> Vec<[f32; 2]> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    let mut layer = 0;
    while layer < STRIDES.len() {
        let stride = STRIDES[layer];
        let mut per_cell = 0;
        while layer < STRIDES.len() && STRIDES[layer] == stride {
            per_cell += ANCHORS_PER_LAYER;
            layer += 1;
        }

        let grid = INPUT_SIZE.div_ceil(stride);
        for y in 0..grid {
            for x in 0..grid {
                let cx = (x as f32 + ANCHOR_OFFSET) / grid as f32;
                let cy = (y as f32 + ANCHOR_OFFSET) / grid as f32;
                for _ in 0..per_cell {
                    anchors.push([cx, cy]);
                }
            }
        }
    }
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_count_and_order() {
        let anchors = generate_anchors();
        assert_eq!(anchors.len(), NUM_ANCHORS);

        let first_cell = 0.5 / 24.0;
        assert_eq!(anchors[0], [first_cell, first_cell]);
        assert_eq!(anchors[1], [first_cell, first_cell]);
        // The stride-16 grid starts after 24 * 24 * 2 anchors.
        assert_eq!(anchors[1152], [0.5 / 12.0, 0.5 / 12.0]);
        assert_eq!(anchors[NUM_ANCHORS - 1], [11.5 / 12.0, 11.5 / 12.0]);
    }
}
