use image::RgbaImage;

use crate::types::{HolisticOutput, Landmark, PalmRegion};

pub const HAND_CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    (0, 5),
    (5, 6),
    (6, 7),
    (7, 8),
    (0, 9),
    (9, 10),
    (10, 11),
    (11, 12),
    (0, 13),
    (13, 14),
    (14, 15),
    (15, 16),
    (0, 17),
    (17, 18),
    (18, 19),
    (19, 20),
    (5, 9),
    (9, 13),
    (13, 17),
];

pub const POSE_CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    (11, 12),
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    (11, 23),
    (12, 24),
    (23, 24),
    (23, 25),
    (24, 26),
    (25, 27),
    (26, 28),
    (27, 29),
    (28, 30),
    (29, 31),
    (30, 32),
    (27, 31),
    (28, 32),
];

const POSE_LINE_COLOR: [u8; 4] = [255, 255, 255, 255];
const POSE_POINT_COLOR: [u8; 4] = [248, 113, 113, 255];
const LEFT_HAND_COLOR: [u8; 4] = [56, 189, 248, 255];
const RIGHT_HAND_COLOR: [u8; 4] = [250, 204, 21, 255];
const HAND_POINT_COLOR: [u8; 4] = [244, 114, 182, 255];
const FACE_POINT_COLOR: [u8; 4] = [16, 185, 129, 255];
const PALM_BOX_COLOR: [u8; 4] = [16, 185, 129, 200];

/// Renders the video output stream: the input frame with every detected
/// landmark set drawn on top.
pub fn annotate(image: &mut RgbaImage, output: &HolisticOutput, visibility_threshold: f32) {
    let (width, height) = image.dimensions();
    let thickness = line_thickness(width, height);
    let buffer: &mut [u8] = &mut **image;

    for region in &output.palm_regions {
        draw_palm_region(buffer, width, height, region, thickness);
    }

    if let Some(face) = &output.face {
        for lm in &face.landmarks {
            draw_circle(
                buffer,
                width,
                height,
                (lm.x as i32, lm.y as i32),
                (thickness / 3).max(1),
                FACE_POINT_COLOR,
            );
        }
    }

    if let Some(pose) = &output.pose {
        let visible = |lm: &Landmark| lm.visibility >= visibility_threshold;
        draw_connections(
            buffer,
            width,
            height,
            &pose.landmarks,
            POSE_CONNECTIONS,
            POSE_LINE_COLOR,
            thickness,
            visible,
        );
        for lm in pose.landmarks.iter().filter(|lm| visible(lm)) {
            draw_circle(
                buffer,
                width,
                height,
                (lm.x as i32, lm.y as i32),
                thickness + 1,
                POSE_POINT_COLOR,
            );
        }
    }

    let hands = [
        (&output.left_hand, LEFT_HAND_COLOR),
        (&output.right_hand, RIGHT_HAND_COLOR),
    ];
    for (hand, color) in hands {
        let Some(hand) = hand else { continue };
        draw_connections(
            buffer,
            width,
            height,
            &hand.landmarks,
            HAND_CONNECTIONS,
            color,
            thickness,
            |_| true,
        );
        for lm in &hand.landmarks {
            draw_circle(
                buffer,
                width,
                height,
                (lm.x as i32, lm.y as i32),
                thickness,
                HAND_POINT_COLOR,
            );
        }
    }
}

fn line_thickness(width: u32, height: u32) -> i32 {
    (width.max(height) as i32 / 240).clamp(1, 8)
}

#[allow(clippy::too_many_arguments)]
fn draw_connections<F>(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    points: &[Landmark],
    connections: &[(usize, usize)],
    color: [u8; 4],
    thickness: i32,
    visible: F,
) where
    F: Fn(&Landmark) -> bool,
{
    for &(a, b) in connections {
        if let (Some(pa), Some(pb)) = (points.get(a), points.get(b)) {
            if visible(pa) && visible(pb) {
                draw_line(buffer, width, height, &pa.point(), &pb.point(), color, thickness);
            }
        }
    }
}

fn draw_palm_region(buffer: &mut [u8], width: u32, height: u32, region: &PalmRegion, thickness: i32) {
    let [x1, y1, x2, y2] = region.bbox;
    let corners = [(x1, y1), (x2, y1), (x2, y2), (x1, y2)];
    for i in 0..corners.len() {
        let next = corners[(i + 1) % corners.len()];
        draw_line(buffer, width, height, &corners[i], &next, PALM_BOX_COLOR, thickness);
    }
}

fn draw_line(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    p0: &(f32, f32),
    p1: &(f32, f32),
    color: [u8; 4],
    thickness: i32,
) {
    let (mut x0, mut y0) = (p0.0 as i32, p0.1 as i32);
    let (x1, y1) = (p1.0 as i32, p1.1 as i32);
    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let radius = (thickness.max(1) - 1) / 2;

    loop {
        put_pixel_safe(buffer, width, height, x0, y0, color);
        if radius > 0 {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if (ox != 0 || oy != 0) && ox.abs() + oy.abs() <= radius {
                        put_pixel_safe(buffer, width, height, x0 + ox, y0 + oy, color);
                    }
                }
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_circle(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    center: (i32, i32),
    radius: i32,
    color: [u8; 4],
) {
    let (cx, cy) = center;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_safe(buffer, width, height, cx + dx, cy + dy, color);
            }
        }
    }
}

fn put_pixel_safe(buffer: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 4]) {
    if x < 0 || y < 0 {
        return;
    }
    let (ux, uy) = (x as u32, y as u32);
    if ux >= width || uy >= height {
        return;
    }
    let idx = ((uy * width + ux) as usize) * 4;
    if idx + 3 < buffer.len() {
        buffer[idx..idx + 4].copy_from_slice(&color);
    }
}
