//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the canonical ArcFace template
//! and resamples the face into a 112×112 crop.

/// ArcFace reference landmarks for a 112×112 output.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst` in closed form.
    ///
    /// With both point sets centred on their means, the rotation-scale part is
    /// `a = Σ(x·u + y·v) / Σ(x² + y²)` and `b = Σ(x·v − y·u) / Σ(x² + y²)`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut energy = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (x, y) = (sx - smx, sy - smy);
            let (u, v) = (dx - dmx, dy - dmy);
            dot += x * u + y * v;
            cross += x * v - y * u;
            energy += x * x + y * y;
        }

        if energy < 1e-12 {
            // Degenerate landmarks: translate only.
            return Self {
                a: 1.0,
                b: 0.0,
                tx: dmx - smx,
                ty: dmy - smy,
            };
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample; out-of-frame pixels read as black.
fn sample(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let at = |px: f32, py: f32| -> f32 {
        if px < 0.0 || py < 0.0 || px >= width as f32 || py >= height as f32 {
            0.0
        } else {
            frame[py as usize * width + px as usize] as f32
        }
    };
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1.0, y0) * fx;
    let bottom = at(x0, y0 + 1.0) * (1.0 - fx) + at(x0 + 1.0, y0 + 1.0) * fx;
    top * (1.0 - fy) + bottom * fy
}

fn warp(frame: &[u8], width: usize, height: usize, to_crop: &Similarity, size: usize) -> Vec<u8> {
    let Some(to_frame) = to_crop.inverse() else {
        return vec![0u8; size * size];
    };

    let mut out = vec![0u8; size * size];
    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = to_frame.apply((ox as f32, oy as f32));
            out[oy * size + ox] = sample(frame, width, height, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Align a detected face to a canonical 112×112 grayscale crop.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = Similarity::estimate(landmarks, &TEMPLATE_112);
    warp(frame, width as usize, height as usize, &transform, ALIGNED_SIZE)
}
