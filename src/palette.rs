use image::{DynamicImage, GenericImageView};
use reqwest::Url;
use serde::{Serialize, Serializer};
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::fetcher::Fetcher;

/// Images are downscaled to fit this box before sampling.
pub const MAX_SAMPLE_DIM: u32 = 120;
/// Larger downloads are abandoned and the default palette used.
pub const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;
const MIN_ALPHA: u8 = 125;
const BUCKETS: usize = 512;
const MIN_HUE_DISTANCE: f32 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }

    /// Hue, saturation and lightness, each in `0.0..=1.0`.
    pub fn hsl(&self) -> (f32, f32, f32) {
        let r = self.0 as f32 / 255.0;
        let g = self.1 as f32 / 255.0;
        let b = self.2 as f32 / 255.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let l = (max + min) / 2.0;
        let d = max - min;
        if d <= f32::EPSILON {
            return (0.0, 0.0, l);
        }
        let s = d / (1.0 - (2.0 * l - 1.0).abs());
        let h = if max == r {
            ((g - b) / d).rem_euclid(6.0)
        } else if max == g {
            (b - r) / d + 2.0
        } else {
            (r - g) / d + 4.0
        };
        (h / 6.0, s.min(1.0), l)
    }

    pub fn from_hsl(h: f32, s: f32, l: f32) -> Self {
        let h = h.rem_euclid(1.0) * 6.0;
        let s = s.clamp(0.0, 1.0);
        let l = l.clamp(0.0, 1.0);
        let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let m = l - c / 2.0;
        let channel = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb(channel(r), channel(g), channel(b))
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaletteSource {
    Extracted,
    Yellow,
    Default,
}

/// Two key colors plus the four corner stops of the backdrop gradient
/// (top-left, top-right, bottom-right, bottom-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Palette {
    pub primary: Rgb,
    pub secondary: Rgb,
    pub corners: [Rgb; 4],
    pub source: PaletteSource,
}

pub const DEFAULT_PALETTE: Palette = Palette {
    primary: Rgb(20, 24, 38),
    secondary: Rgb(58, 32, 74),
    corners: [
        Rgb(20, 24, 38),
        Rgb(40, 28, 60),
        Rgb(58, 32, 74),
        Rgb(14, 16, 26),
    ],
    source: PaletteSource::Default,
};

/// Yellow posters produce muddy gradients, so they get this one instead.
pub const YELLOW_PALETTE: Palette = Palette {
    primary: Rgb(92, 68, 18),
    secondary: Rgb(36, 48, 84),
    corners: [
        Rgb(92, 68, 18),
        Rgb(60, 44, 16),
        Rgb(36, 48, 84),
        Rgb(18, 20, 30),
    ],
    source: PaletteSource::Yellow,
};

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    r: u64,
    g: u64,
    b: u64,
    count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    color: Rgb,
    h: f32,
    s: f32,
    l: f32,
    score: f32,
}

pub fn extract(image: &DynamicImage) -> Palette {
    let (width, height) = image.dimensions();
    let sample = if width > MAX_SAMPLE_DIM || height > MAX_SAMPLE_DIM {
        image.thumbnail(MAX_SAMPLE_DIM, MAX_SAMPLE_DIM)
    } else {
        image.clone()
    };

    let mut buckets = [Bucket::default(); BUCKETS];
    let mut total = 0u64;
    for pixel in sample.to_rgba8().pixels() {
        let [r, g, b, a] = pixel.0;
        if a < MIN_ALPHA {
            continue;
        }
        let index = ((r >> 5) as usize) << 6 | ((g >> 5) as usize) << 3 | (b >> 5) as usize;
        let bucket = &mut buckets[index];
        bucket.r += r as u64;
        bucket.g += g as u64;
        bucket.b += b as u64;
        bucket.count += 1;
        total += 1;
    }
    if total == 0 {
        debug!("No opaque pixels, using default palette");
        return DEFAULT_PALETTE;
    }

    let mut candidates: Vec<Candidate> = buckets
        .iter()
        .filter(|b| b.count > 0)
        .filter_map(|b| {
            let color = Rgb(
                (b.r / b.count) as u8,
                (b.g / b.count) as u8,
                (b.b / b.count) as u8,
            );
            let (h, s, l) = color.hsl();
            if is_filtered(h, s, l) {
                return None;
            }
            let share = b.count as f32 / total as f32;
            let score = 2.0 * s + hue_bonus(h) + (1.0 - (l - 0.45).abs() * 2.0) + 1.5 * share;
            Some(Candidate {
                color,
                h,
                s,
                l,
                score,
            })
        })
        .collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let Some(top) = candidates.first().copied() else {
        debug!("Every color bucket filtered out, using default palette");
        return DEFAULT_PALETTE;
    };
    if (0.10..=0.18).contains(&top.h) {
        return YELLOW_PALETTE;
    }

    let secondary = candidates
        .iter()
        .skip(1)
        .find(|c| hue_distance(c.h, top.h) >= MIN_HUE_DISTANCE)
        .map(|c| c.color)
        .unwrap_or_else(|| Rgb::from_hsl(top.h + MIN_HUE_DISTANCE, top.s * 0.8, top.l * 0.7));
    let primary = top.color;

    Palette {
        primary,
        secondary,
        corners: [
            shade(primary, 0.32),
            shade(secondary, 0.28),
            shade(primary, 0.18),
            shade(secondary, 0.12),
        ],
        source: PaletteSource::Extracted,
    }
}

/// Near-white, near-black, washed-out and beige buckets never lead a palette.
fn is_filtered(h: f32, s: f32, l: f32) -> bool {
    if !(0.06..=0.92).contains(&l) {
        return true;
    }
    if s < 0.12 || (s < 0.25 && l > 0.7) {
        return true;
    }
    (0.08..=0.17).contains(&h) && s < 0.55 && l > 0.6
}

fn hue_bonus(h: f32) -> f32 {
    match h * 360.0 {
        d if !(15.0..345.0).contains(&d) => 0.25,
        d if d < 45.0 => 0.05,
        d if d < 70.0 => -0.15,
        d if d < 170.0 => -0.1,
        d if d < 260.0 => 0.35,
        _ => 0.2,
    }
}

fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).abs();
    d.min(1.0 - d)
}

fn shade(color: Rgb, lightness: f32) -> Rgb {
    let (h, s, _) = color.hsl();
    Rgb::from_hsl(h, s.min(0.85), lightness)
}

pub fn extract_from_bytes(data: &[u8]) -> Palette {
    match image::load_from_memory(data) {
        Ok(img) => extract(&img),
        Err(e) => {
            warn!("Failed to decode image for palette: {}", e);
            DEFAULT_PALETTE
        }
    }
}

/// Fetches and samples an image. Any failure yields [`DEFAULT_PALETTE`].
pub async fn extract_from_url(fetcher: &Fetcher, url: &str) -> Palette {
    match fetcher.get_bytes_capped(url, MAX_IMAGE_BYTES).await {
        Ok(bytes) => extract_from_bytes(&bytes),
        Err(e) => {
            warn!("Failed to fetch {} for palette: {}", url, e);
            DEFAULT_PALETTE
        }
    }
}

/// Whether a client-supplied image URL may be downloaded. Only http(s) URLs
/// naming a public host qualify; loopback, private and link-local addresses
/// never do. A non-empty `allowed_hosts` further limits downloads to those
/// hosts and their subdomains.
pub fn is_allowed_image_url(url: &str, allowed_hosts: &[String]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str().map(|h| h.trim_matches(['[', ']']).to_ascii_lowercase())
    else {
        return false;
    };
    if host == "localhost" || host.ends_with(".localhost") {
        return false;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if !is_public_ip(ip) {
            return false;
        }
    }
    allowed_hosts.is_empty()
        || allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}
