//! Trophy manifest parsing and level computation.
//!
//! A user's `trophy/trophies.xml` accumulates per-title counts:
//!
//! ```xml
//! <trophies>
//!   <trophy unlocked_count="12" bronze="8" silver="3" gold="1" platinum="0"/>
//! </trophies>
//! ```
//!
//! Counts weigh into points (15/30/90/300 per bronze/silver/gold/platinum)
//! and the points map to a level plus 0-99 progress through a piecewise
//! table.  A missing or malformed manifest reads as the level-1 default.

use serde::Serialize;

use crate::store::Store;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrophySummary {
    pub level: u32,
    pub progress: u32,
    pub total: i64,
    pub bronze: i64,
    pub silver: i64,
    pub gold: i64,
    pub platinum: i64,
}

impl Default for TrophySummary {
    fn default() -> Self {
        TrophySummary {
            level: 1,
            progress: 0,
            total: 0,
            bronze: 0,
            silver: 0,
            gold: 0,
            platinum: 0,
        }
    }
}

struct LevelRange {
    start_level: u32,
    end_level: u32,
    points_per_level: i64,
    start_points: i64,
}

const RANGES: [LevelRange; 10] = [
    LevelRange { start_level: 1, end_level: 99, points_per_level: 60, start_points: 0 },
    LevelRange { start_level: 100, end_level: 199, points_per_level: 90, start_points: 5_940 },
    LevelRange { start_level: 200, end_level: 299, points_per_level: 450, start_points: 14_940 },
    LevelRange { start_level: 300, end_level: 399, points_per_level: 900, start_points: 59_940 },
    LevelRange { start_level: 400, end_level: 499, points_per_level: 1_350, start_points: 149_940 },
    LevelRange { start_level: 500, end_level: 599, points_per_level: 1_800, start_points: 284_940 },
    LevelRange { start_level: 600, end_level: 699, points_per_level: 2_250, start_points: 464_940 },
    LevelRange { start_level: 700, end_level: 799, points_per_level: 2_700, start_points: 689_940 },
    LevelRange { start_level: 800, end_level: 899, points_per_level: 3_150, start_points: 959_940 },
    LevelRange { start_level: 900, end_level: 999, points_per_level: 3_600, start_points: 1_274_940 },
];

/// Map trophy points onto (level, progress).  Negative points clamp to zero;
/// anything past the table caps at level 999, progress 100.
pub fn level_for_points(points: i64) -> (u32, u32) {
    let points = points.max(0);

    for range in &RANGES {
        let range_points =
            i64::from(range.end_level - range.start_level + 1) * range.points_per_level;
        if points < range.start_points + range_points {
            let offset = points - range.start_points;
            let level = range.start_level + (offset / range.points_per_level) as u32;
            let progress = ((offset % range.points_per_level) * 100 / range.points_per_level) as u32;
            return (level, progress);
        }
    }

    (999, 100)
}

pub fn points_for_counts(bronze: i64, silver: i64, gold: i64, platinum: i64) -> i64 {
    bronze * 15 + silver * 30 + gold * 90 + platinum * 300
}

fn parse_manifest(xml: &str) -> Option<TrophySummary> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    let root = doc.root_element();
    if !root.has_tag_name("trophies") {
        return None;
    }

    let attr = |node: roxmltree::Node<'_, '_>, name: &str| -> i64 {
        node.attribute(name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    };

    let mut unlocked = 0;
    let mut bronze = 0;
    let mut silver = 0;
    let mut gold = 0;
    let mut platinum = 0;

    for trophy in root.children().filter(|n| n.has_tag_name("trophy")) {
        unlocked += attr(trophy, "unlocked_count");
        bronze += attr(trophy, "bronze");
        silver += attr(trophy, "silver");
        gold += attr(trophy, "gold");
        platinum += attr(trophy, "platinum");
    }

    let total = if unlocked > 0 {
        unlocked
    } else {
        bronze + silver + gold + platinum
    };
    let (level, progress) = level_for_points(points_for_counts(bronze, silver, gold, platinum));

    Some(TrophySummary {
        level,
        progress,
        total,
        bronze,
        silver,
        gold,
        platinum,
    })
}

/// Summarise a user's trophies; missing or unreadable manifests yield the
/// default summary.
pub fn load_summary(store: &Store, npid: &str) -> TrophySummary {
    std::fs::read_to_string(store.trophies_xml_path(npid))
        .ok()
        .and_then(|xml| parse_manifest(&xml))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_table_edges() {
        assert_eq!(level_for_points(-5), (1, 0));
        assert_eq!(level_for_points(0), (1, 0));
        assert_eq!(level_for_points(30), (1, 50));
        assert_eq!(level_for_points(60), (2, 0));
        // Last point of the first band: level 99, 59/60 through.
        assert_eq!(level_for_points(5_939), (99, 98));
        // First point of the second band.
        assert_eq!(level_for_points(5_940), (100, 0));
        assert_eq!(level_for_points(14_940), (200, 0));
        assert_eq!(level_for_points(1_274_940), (900, 0));
        // Past the table.
        assert_eq!(level_for_points(1_634_940), (999, 100));
        assert_eq!(level_for_points(i64::MAX), (999, 100));
    }

    #[test]
    fn points_weighting() {
        assert_eq!(points_for_counts(1, 1, 1, 1), 15 + 30 + 90 + 300);
        assert_eq!(points_for_counts(0, 0, 0, 0), 0);
    }

    #[test]
    fn manifest_accumulates_across_titles() {
        let xml = r#"
            <trophies>
              <trophy unlocked_count="4" bronze="2" silver="1" gold="1" platinum="0"/>
              <trophy unlocked_count="3" bronze="3" silver="0" gold="0" platinum="0"/>
            </trophies>
        "#;
        let summary = parse_manifest(xml).unwrap();
        assert_eq!(summary.total, 7);
        assert_eq!(summary.bronze, 5);
        assert_eq!(summary.silver, 1);
        assert_eq!(summary.gold, 1);
        let expected = level_for_points(points_for_counts(5, 1, 1, 0));
        assert_eq!((summary.level, summary.progress), expected);
    }

    #[test]
    fn manifest_without_unlocked_counts_sums_grades() {
        let xml = r#"<trophies><trophy bronze="2" silver="1"/></trophies>"#;
        let summary = parse_manifest(xml).unwrap();
        assert_eq!(summary.total, 3);
    }

    #[test]
    fn malformed_manifest_is_default() {
        assert!(parse_manifest("not xml at all").is_none());
        assert!(parse_manifest("<saves/>").is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let store = Store::new(std::env::temp_dir().join("v3kn-trophies-missing"));
        assert_eq!(load_summary(&store, "ghost"), TrophySummary::default());
    }
}
