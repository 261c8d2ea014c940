//! GPU tile placement annotations to Level Zero affinity masks.
//!
//! A tile annotation looks like `card0:gt0+gt1,card1:gt0|card2:gt1`: `|`
//! separates the GPU using containers of a pod, `,` the cards of one
//! container and `+` the tiles of one card.

use std::collections::HashSet;

use tracing::warn;

/// Container environment variable selecting the device hierarchy.
pub const HIERARCHY_ENV: &str = "ZE_FLAT_DEVICE_HIERARCHY";

/// Environment variable the mask is injected as.
pub const AFFINITY_MASK_ENV: &str = "ZE_AFFINITY_MASK";

/// How tiles are exposed to the workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HierarchyMode {
    /// `card.tile` pairs.
    Composite,
    /// One flat index per tile, `card * tiles_per_card + tile`.
    #[default]
    Flat,
    /// Flat indices counted with a running offset over the selected cards.
    Combined,
}

impl HierarchyMode {
    /// Mode requested by a container. Unknown values fall back to flat.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("COMPOSITE") => Self::Composite,
            Some(v) if v.eq_ignore_ascii_case("COMBINED") => Self::Combined,
            _ => Self::Flat,
        }
    }
}

/// Segment of a `|` separated per container annotation for the n:th GPU
/// using container. Empty segments are skipped.
pub fn container_segment(annotation: &str, container_index: usize) -> Option<&str> {
    annotation
        .split('|')
        .filter(|segment| !segment.is_empty())
        .nth(container_index)
}

/// Convert one container's tile segment into an affinity mask.
///
/// Any malformed card or tile yields an empty mask.
pub fn affinity_mask(segment: &str, mode: HierarchyMode, tiles_per_card: u32) -> String {
    match parse_segment(segment, tiles_per_card) {
        Some(cards) => format_mask(&cards, mode, tiles_per_card),
        None => String::new(),
    }
}

fn parse_segment(segment: &str, tiles_per_card: u32) -> Option<Vec<Vec<u32>>> {
    let mut seen = HashSet::new();
    let mut cards = Vec::new();

    for card_tiles in segment.split(',') {
        let Some((card, tiles)) = card_tiles.split_once(':') else {
            warn!(card_tiles, "Invalid card tile combo");
            return None;
        };
        if !is_card_name(card) {
            warn!(card, "Invalid card name");
            return None;
        }
        if !seen.insert(card) {
            warn!(card, "Card listed twice for one container");
            return None;
        }

        let mut indices = Vec::new();
        for tile in tiles.split('+') {
            let index = tile
                .strip_prefix("gt")
                .and_then(|n| n.parse::<u16>().ok())
                .map(u32::from)
                .filter(|&n| n < tiles_per_card);
            let Some(index) = index else {
                warn!(tile, tiles_per_card, "Invalid tile syntax");
                return None;
            };
            indices.push(index);
        }
        cards.push(indices);
    }

    Some(cards)
}

fn is_card_name(name: &str) -> bool {
    name.strip_prefix("card")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn format_mask(cards: &[Vec<u32>], mode: HierarchyMode, tiles_per_card: u32) -> String {
    let tiles_per_card = u64::from(tiles_per_card);
    let mut entries = Vec::new();
    let mut offset = 0u64;

    for (position, tiles) in cards.iter().enumerate() {
        let position = position as u64;
        for &tile in tiles {
            let tile = u64::from(tile);
            entries.push(match mode {
                HierarchyMode::Composite => format!("{position}.{tile}"),
                HierarchyMode::Flat => (position * tiles_per_card + tile).to_string(),
                HierarchyMode::Combined => (offset + tile).to_string(),
            });
        }
        offset += tiles_per_card;
    }

    entries.join(",")
}
