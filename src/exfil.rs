//! This module is responsible for getting PSD frames out of the process:
//! the report payload sent upstream and the rendered plot file.

use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    welch::{Scale, Spectrum},
};

pub const PLOT_WIDTH: u32 = 900;
pub const PLOT_HEIGHT: u32 = 400;
const MARGIN: u32 = 40;
const GRID_DIVISIONS: u32 = 10;

const BACKGROUND: Rgb<u8> = Rgb([17, 17, 17]);
const GRID: Rgb<u8> = Rgb([60, 66, 75]);
const FRAME: Rgb<u8> = Rgb([200, 200, 200]);
const TRACE: Rgb<u8> = Rgb([59, 130, 246]);

/// One PSD estimate with its frequency axis
#[derive(Debug, Clone, PartialEq)]
pub struct PsdFrame {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
    pub start_freq_hz: f64,
    pub end_freq_hz: f64,
    pub scale: Scale,
    pub timestamp: DateTime<Utc>,
    pub device: String,
}

impl PsdFrame {
    pub fn from_spectrum(spectrum: Spectrum, scale: Scale, device: impl Into<String>) -> Self {
        let start_freq_hz = spectrum.freqs.first().copied().unwrap_or_default();
        let end_freq_hz = spectrum.freqs.last().copied().unwrap_or_default();
        Self {
            freqs: spectrum.freqs,
            power: spectrum.power,
            start_freq_hz,
            end_freq_hz,
            scale,
            timestamp: Utc::now(),
            device: device.into(),
        }
    }

    pub fn report(&self) -> PsdReport {
        PsdReport {
            pxx: self.power.clone(),
            start_freq_hz: self.start_freq_hz,
            end_freq_hz: self.end_freq_hz,
            timestamp: self.timestamp.timestamp_millis(),
            mac: self.device.clone(),
        }
    }
}

/// Payload posted to the collection service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsdReport {
    #[serde(rename = "Pxx")]
    pub pxx: Vec<f64>,
    pub start_freq_hz: f64,
    pub end_freq_hz: f64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub mac: String,
}

impl PsdReport {
    pub fn validate(&self) -> Result<()> {
        validate_psd(&self.pxx, self.start_freq_hz, self.end_freq_hz)
    }
}

fn validate_psd(power: &[f64], start: f64, end: f64) -> Result<()> {
    if power.is_empty() {
        return Err(Error::InvalidPsd("empty power array"));
    }
    if !(end > start) {
        return Err(Error::InvalidPsd("non-positive frequency span"));
    }
    Ok(())
}

/// Most recent frame, shared between the worker and whoever renders on demand
#[derive(Debug, Default)]
pub struct LatestFrame {
    frame: Mutex<Option<PsdFrame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: PsdFrame) {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn get(&self) -> Option<PsdFrame> {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Render the latest frame, failing with [`Error::NoFrame`] before the first one
    pub fn render(&self, path: &Path) -> Result<()> {
        let frame = self.get().ok_or(Error::NoFrame)?;
        render_png(&frame.power, frame.start_freq_hz, frame.end_freq_hz, path)
    }
}

/// Draw `power` over a linear axis from `start` to `end` Hz into a PNG at `path`
pub fn render_png(power: &[f64], start: f64, end: f64, path: &Path) -> Result<()> {
    validate_psd(power, start, end)?;
    let img = draw_plot(power);
    img.save(path)?;
    debug!(path = %path.display(), bins = power.len(), "Rendered PSD plot");
    Ok(())
}

fn draw_plot(power: &[f64]) -> RgbImage {
    let mut img = RgbImage::from_pixel(PLOT_WIDTH, PLOT_HEIGHT, BACKGROUND);
    let (x0, y0) = (MARGIN as i64, MARGIN as i64);
    let (x1, y1) = ((PLOT_WIDTH - MARGIN) as i64, (PLOT_HEIGHT - MARGIN) as i64);

    for i in 1..GRID_DIVISIONS {
        let x = x0 + (x1 - x0) * i as i64 / GRID_DIVISIONS as i64;
        let y = y0 + (y1 - y0) * i as i64 / GRID_DIVISIONS as i64;
        draw_line(&mut img, (x, y0), (x, y1), GRID);
        draw_line(&mut img, (x0, y), (x1, y), GRID);
    }
    draw_line(&mut img, (x0, y0), (x1, y0), FRAME);
    draw_line(&mut img, (x1, y0), (x1, y1), FRAME);
    draw_line(&mut img, (x1, y1), (x0, y1), FRAME);
    draw_line(&mut img, (x0, y1), (x0, y0), FRAME);

    let finite = power.iter().copied().filter(|p| p.is_finite());
    let lo = finite.clone().fold(f64::INFINITY, f64::min);
    let hi = finite.fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() {
        return img;
    }
    let range = if hi > lo { hi - lo } else { 1.0 };
    let n = power.len();
    let to_px = |i: usize, p: f64| {
        let fx = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.5 };
        let fy = (p.clamp(lo, hi) - lo) / range;
        (
            x0 + (fx * (x1 - x0) as f64).round() as i64,
            y1 - (fy * (y1 - y0) as f64).round() as i64,
        )
    };
    let mut prev = None;
    for (i, &p) in power.iter().enumerate() {
        let pt = to_px(i, p);
        match prev {
            Some(from) => draw_line(&mut img, from, pt, TRACE),
            None => put(&mut img, pt, TRACE),
        }
        prev = Some(pt);
    }
    img
}

fn put(img: &mut RgbImage, (x, y): (i64, i64), color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

// Bresenham
fn draw_line(img: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(img, (x, y), color);
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
