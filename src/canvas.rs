use std::fmt;

use serde::{Serialize, Serializer};
use tokio::sync::Mutex;
use tracing::trace;

/// An RGB triple, serialized on the wire as `[r, g, b]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const BLACK: Rgb = Rgb([0, 0, 0]);

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb([r, g, b])
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    #[error("Pixel ({x},{y}) outside canvas {width}x{height}")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: usize,
        height: usize,
    },
}

/// The shared pixel grid. Every access goes through one mutex, which is only
/// held for the grid read or write itself.
#[derive(Debug)]
pub struct Canvas {
    width: usize,
    height: usize,
    pixels: Mutex<Vec<Rgb>>,
}

impl Canvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: Mutex::new(vec![Rgb::BLACK; width * height]),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn index(&self, x: i64, y: i64) -> Result<usize, CanvasError> {
        let out_of_bounds = CanvasError::OutOfBounds {
            x,
            y,
            width: self.width,
            height: self.height,
        };

        let col = usize::try_from(x).map_err(|_| out_of_bounds)?;
        let row = usize::try_from(y).map_err(|_| out_of_bounds)?;

        if col >= self.width || row >= self.height {
            return Err(out_of_bounds);
        }

        Ok(row * self.width + col)
    }

    pub async fn get_pixel(&self, x: i64, y: i64) -> Result<Rgb, CanvasError> {
        let idx = self.index(x, y)?;
        let pixels = self.pixels.lock().await;
        Ok(pixels[idx])
    }

    pub async fn set_pixel(&self, x: i64, y: i64, color: Rgb) -> Result<(), CanvasError> {
        let idx = self.index(x, y)?;
        {
            let mut pixels = self.pixels.lock().await;
            pixels[idx] = color;
        }
        trace!(x, y, color = %color, "Pixel written");
        Ok(())
    }

    /// Copies the whole grid while holding the lock once.
    pub async fn snapshot(&self) -> CanvasSnapshot {
        let pixels = self.pixels.lock().await.clone();
        CanvasSnapshot {
            width: self.width,
            height: self.height,
            pixels,
        }
    }
}

/// A value copy of the grid, serialized as rows of `[r, g, b]` cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasSnapshot {
    width: usize,
    height: usize,
    pixels: Vec<Rgb>,
}

impl CanvasSnapshot {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(y * self.width + x).copied()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Rgb]> {
        self.pixels.chunks(self.width.max(1))
    }
}

impl Serialize for CanvasSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows())
    }
}
