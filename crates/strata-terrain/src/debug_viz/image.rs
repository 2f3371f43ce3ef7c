//! A 2D debug image represented as a flat array of RGBA pixels.

use hashbrown::HashSet;

/// Row-major RGBA image, one pixel per grid cell.
#[derive(Clone, Debug, PartialEq)]
pub struct DebugImage {
    pub width: u32,
    pub height: u32,
    /// Length = `width * height * 4`.
    pub pixels: Vec<u8>,
}

impl DebugImage {
    /// Create a new black (all-zero) image with the given dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    /// Set a single pixel's RGBA value.
    ///
    /// # Panics
    ///
    /// Panics if `x >= width` or `y >= height`.
    pub fn set_pixel(&mut self, x: u32, y: u32, r: u8, g: u8, b: u8, a: u8) {
        let idx = self.offset(x, y);
        self.pixels[idx..idx + 4].copy_from_slice(&[r, g, b, a]);
    }

    /// Set a pixel if it lies inside the image; overlays use signed coordinates.
    pub fn put(&mut self, x: i64, y: i64, rgb: [u8; 3]) {
        if x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64 {
            self.set_pixel(x as u32, y as u32, rgb[0], rgb[1], rgb[2], 255);
        }
    }

    /// Get a pixel's RGBA value.
    ///
    /// # Panics
    ///
    /// Panics if `x >= width` or `y >= height`.
    pub fn get_pixel(&self, x: u32, y: u32) -> (u8, u8, u8, u8) {
        let idx = self.offset(x, y);
        (
            self.pixels[idx],
            self.pixels[idx + 1],
            self.pixels[idx + 2],
            self.pixels[idx + 3],
        )
    }

    /// Bresenham line between two pixel positions.
    pub fn line(&mut self, from: (i64, i64), to: (i64, i64), rgb: [u8; 3]) {
        let (mut x, mut y) = from;
        let dx = (to.0 - x).abs();
        let dy = -(to.1 - y).abs();
        let sx = if x < to.0 { 1 } else { -1 };
        let sy = if y < to.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x, y, rgb);
            if (x, y) == to {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Filled square marker of half-size `r` centred on `(x, y)`.
    pub fn marker(&mut self, x: i64, y: i64, r: i64, rgb: [u8; 3]) {
        for py in y - r..=y + r {
            for px in x - r..=x + r {
                self.put(px, py, rgb);
            }
        }
    }

    /// Returns `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Count the number of unique colors (ignoring alpha) in the image.
    pub fn unique_color_count(&self) -> usize {
        self.pixels
            .chunks_exact(4)
            .map(|c| (c[0], c[1], c[2]))
            .collect::<HashSet<_>>()
            .len()
    }
}
