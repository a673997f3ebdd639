//! Remote cursor and selection presence.
//!
//! Presence is ephemeral: every update overwrites the previous entry for that
//! site, nothing is persisted, and sites that stop sending updates linger until
//! [`PresenceMap::prune_idle`] drops them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color derived from a site id.
    pub fn from_site(site_id: &str) -> Self {
        let hue = (fnv1a(site_id.as_bytes()) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if digits.len() != 6 && digits.len() != 8 {
            return None;
        }
        let channel = |i: usize| -> Option<f32> {
            let byte = u8::from_str_radix(digits.get(i..i + 2)?, 16).ok()?;
            Some(byte as f32 / 255.0)
        };
        let a = if digits.len() == 8 { channel(6)? } else { 1.0 };
        Some(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
            a,
        })
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

impl fmt::Display for CursorColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote state
// ───────────────────────────────────────────────────────────────────

/// Last known caret of a remote site.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub site_id: String,
    pub position: usize,
    pub color: CursorColor,
    last_seen: Instant,
}

impl RemoteCursor {
    pub fn time_since_update(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Last known selection range of a remote site.
#[derive(Debug, Clone)]
pub struct RemoteSelection {
    pub site_id: String,
    pub start: usize,
    pub end: usize,
    pub color: CursorColor,
    last_seen: Instant,
}

impl RemoteSelection {
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn time_since_update(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Cursors and selections of every remote site in one document.
#[derive(Debug)]
pub struct PresenceMap {
    local_site_id: String,
    cursors: HashMap<String, RemoteCursor>,
    selections: HashMap<String, RemoteSelection>,
}

impl PresenceMap {
    pub fn new(local_site_id: impl Into<String>) -> Self {
        Self {
            local_site_id: local_site_id.into(),
            cursors: HashMap::new(),
            selections: HashMap::new(),
        }
    }

    /// Upsert a remote cursor. Updates from the local site are ignored.
    pub fn update_cursor(&mut self, site_id: &str, position: usize, color: CursorColor) -> bool {
        if site_id == self.local_site_id {
            return false;
        }
        self.cursors.insert(
            site_id.to_string(),
            RemoteCursor {
                site_id: site_id.to_string(),
                position,
                color,
                last_seen: Instant::now(),
            },
        );
        true
    }

    /// Upsert a remote selection; `start`/`end` are normalized so `start <= end`.
    pub fn update_selection(
        &mut self,
        site_id: &str,
        start: usize,
        end: usize,
        color: CursorColor,
    ) -> bool {
        if site_id == self.local_site_id {
            return false;
        }
        self.selections.insert(
            site_id.to_string(),
            RemoteSelection {
                site_id: site_id.to_string(),
                start: start.min(end),
                end: start.max(end),
                color,
                last_seen: Instant::now(),
            },
        );
        true
    }

    pub fn cursor(&self, site_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(site_id)
    }

    pub fn selection(&self, site_id: &str) -> Option<&RemoteSelection> {
        self.selections.get(site_id)
    }

    pub fn cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn selections(&self) -> impl Iterator<Item = &RemoteSelection> {
        self.selections.values()
    }

    /// Number of distinct remote sites with any presence entry.
    pub fn site_count(&self) -> usize {
        let mut count = self.cursors.len();
        count += self
            .selections
            .keys()
            .filter(|site| !self.cursors.contains_key(*site))
            .count();
        count
    }

    pub fn remove_site(&mut self, site_id: &str) -> bool {
        let cursor = self.cursors.remove(site_id).is_some();
        let selection = self.selections.remove(site_id).is_some();
        cursor || selection
    }

    /// Drop entries not refreshed within `timeout`; returns the affected sites.
    pub fn prune_idle(&mut self, timeout: Duration) -> Vec<String> {
        let mut pruned: Vec<String> = Vec::new();
        self.cursors.retain(|site, cursor| {
            let keep = cursor.last_seen.elapsed() <= timeout;
            if !keep {
                pruned.push(site.clone());
            }
            keep
        });
        self.selections.retain(|site, selection| {
            let keep = selection.last_seen.elapsed() <= timeout;
            if !keep && !pruned.contains(site) {
                pruned.push(site.clone());
            }
            keep
        });
        if !pruned.is_empty() {
            log::debug!("Pruned idle presence for {} site(s)", pruned.len());
        }
        pruned
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
        self.selections.clear();
    }
}
