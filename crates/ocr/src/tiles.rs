use std::collections::{HashMap, HashSet};

use crate::geometry::Region;

/// One cell of the tiling grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
    pub region: Region,
}

/// Recognized text of one tile.
#[derive(Debug, Clone)]
pub struct TileText {
    pub row: u32,
    pub col: u32,
    pub text: String,
    pub confidence: f32,
}

/// Overlapping grid over a `width`×`height` page, row-major. Interior tiles
/// are `tile_size` square and neighbours share `overlap` pixels; tiles on the
/// right and bottom edges are clipped to the page.
pub fn plan(width: u32, height: u32, tile_size: u32, overlap: u32) -> Vec<Tile> {
    if width == 0 || height == 0 || tile_size == 0 {
        return Vec::new();
    }
    let step = tile_size.saturating_sub(overlap).max(1);
    let xs = starts(width, tile_size, step);
    let ys = starts(height, tile_size, step);
    let mut tiles = Vec::with_capacity(xs.len() * ys.len());
    for (row, &y) in ys.iter().enumerate() {
        for (col, &x) in xs.iter().enumerate() {
            tiles.push(Tile {
                row: row as u32,
                col: col as u32,
                region: Region {
                    x,
                    y,
                    width: tile_size.min(width - x),
                    height: tile_size.min(height - y),
                },
            });
        }
    }
    tiles
}

fn starts(extent: u32, tile_size: u32, step: u32) -> Vec<u32> {
    let mut out = vec![0];
    let mut s = 0;
    while s + tile_size < extent {
        s += step;
        out.push(s);
    }
    out
}

fn line_key(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Concatenate tile texts in row-major order, dropping lines that an
/// already-emitted neighbour (left, upper-left, upper, upper-right) produced
/// from the shared seam. Repeats inside one tile are kept. Returns the text
/// and the length-weighted mean confidence.
pub fn merge(tiles: &[TileText]) -> (String, f32) {
    let mut ordered: Vec<&TileText> = tiles.iter().collect();
    ordered.sort_by_key(|t| (t.row, t.col));

    let mut seen: HashMap<(u32, u32), HashSet<String>> = HashMap::new();
    let mut lines: Vec<&str> = Vec::new();
    let mut weighted = 0f64;
    let mut weight = 0f64;

    for tile in ordered {
        let keys: HashSet<String> =
            tile.text.lines().map(line_key).filter(|k| !k.is_empty()).collect();
        if keys.is_empty() {
            continue;
        }
        let (r, c) = (tile.row as i64, tile.col as i64);
        let neighbours = [(r, c - 1), (r - 1, c - 1), (r - 1, c), (r - 1, c + 1)];
        let mut emitted = 0usize;
        for line in tile.text.lines() {
            let key = line_key(line);
            if key.is_empty() {
                continue;
            }
            let duplicate = neighbours.iter().any(|&(nr, nc)| {
                nr >= 0
                    && nc >= 0
                    && seen.get(&(nr as u32, nc as u32)).is_some_and(|s| s.contains(&key))
            });
            if !duplicate {
                lines.push(line.trim_end());
                emitted += key.len();
            }
        }
        weighted += tile.confidence as f64 * emitted as f64;
        weight += emitted as f64;
        seen.insert((tile.row, tile.col), keys);
    }

    let confidence = if weight > 0.0 { (weighted / weight) as f32 } else { 0.0 };
    (lines.join("\n"), confidence.clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(row: u32, col: u32, text: &str, confidence: f32) -> TileText {
        TileText { row, col, text: text.to_string(), confidence }
    }

    #[test]
    fn plan_covers_page_with_overlap() {
        let tiles = plan(2400, 2400, 1000, 50);
        assert_eq!(tiles.len(), 9);
        let xs: Vec<u32> = tiles.iter().take(3).map(|t| t.region.x).collect();
        assert_eq!(xs, vec![0, 950, 1900]);
        let last = tiles.last().unwrap();
        assert_eq!((last.row, last.col), (2, 2));
        assert_eq!(last.region.x + last.region.width, 2400);
        assert_eq!(last.region.y + last.region.height, 2400);
        // Row-major.
        assert!(tiles.windows(2).all(|w| (w[0].row, w[0].col) < (w[1].row, w[1].col)));
    }

    #[test]
    fn plan_for_8000_square_page() {
        let tiles = plan(8000, 8000, 1000, 50);
        assert_eq!(tiles.len(), 81);
        assert!(tiles.iter().all(|t| t.region.width <= 1000 && t.region.height <= 1000));
    }

    #[test]
    fn small_page_is_one_tile() {
        let tiles = plan(640, 480, 1000, 50);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].region, Region { x: 0, y: 0, width: 640, height: 480 });
    }

    #[test]
    fn seam_lines_are_dropped() {
        let tiles = [
            text(0, 0, "INVOICE 42\nITEM A 3.00", 80.0),
            text(0, 1, "ITEM A 3.00\nDUE 30 DAYS", 80.0),
            text(1, 0, "item a   3.00\nTOTAL 9.00", 80.0),
            text(1, 1, "DUE 30 DAYS\nTHANK YOU", 80.0),
        ];
        let (merged, confidence) = merge(&tiles);
        assert_eq!(merged, "INVOICE 42\nITEM A 3.00\nDUE 30 DAYS\nTOTAL 9.00\nTHANK YOU");
        assert_eq!(confidence, 80.0);
    }

    #[test]
    fn distant_repeats_are_kept() {
        let tiles = [
            text(0, 0, "COFFEE 2.50", 90.0),
            text(0, 1, "", 0.0),
            text(0, 2, "", 0.0),
            text(0, 3, "COFFEE 2.50", 90.0),
        ];
        let (merged, _) = merge(&tiles);
        assert_eq!(merged.lines().count(), 2);
    }

    #[test]
    fn repeats_within_a_tile_are_kept() {
        let (merged, _) = merge(&[text(0, 0, "1 x TEA\n1 x TEA", 70.0)]);
        assert_eq!(merged, "1 x TEA\n1 x TEA");
    }

    #[test]
    fn confidence_is_length_weighted() {
        let tiles = [text(0, 0, "AAAAAAAAAAAAAAAAAAAA", 90.0), text(5, 5, "BBBBB", 40.0)];
        let (_, confidence) = merge(&tiles);
        assert!((confidence - 80.0).abs() < 1e-3, "{confidence}");
    }

    #[test]
    fn input_order_does_not_matter() {
        let a = [text(0, 0, "A", 50.0), text(0, 1, "A\nB", 50.0)];
        let b = [a[1].clone(), a[0].clone()];
        assert_eq!(merge(&a), merge(&b));
    }
}
