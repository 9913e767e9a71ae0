//! Auto-tiling: pick a tile's sprite index from which of its four
//! neighbors are occupied.
//!
//! The result must be identical on every replica, so everything here is a
//! pure function of the tile set it is given.

use std::collections::HashMap;

use crate::{BoardOp, Tile, TileKey, TileLayer};

/// Neighbor mask → canonical index (4 corners, 4 edges, center).
pub const AUTO_TILE_TABLE: [u32; 16] = [4, 7, 3, 6, 1, 4, 0, 3, 5, 8, 4, 7, 2, 5, 1, 4];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeighborConfig {
    pub top: bool,
    pub bottom: bool,
    pub left: bool,
    pub right: bool,
}

impl NeighborConfig {
    /// N=1, E=2, S=4, W=8.
    pub fn mask(&self) -> usize {
        (self.top as usize) | (self.right as usize) << 1 | (self.bottom as usize) << 2 | (self.left as usize) << 3
    }

    pub fn from_mask(mask: usize) -> Self {
        Self {
            top: mask & 1 != 0,
            right: mask & 2 != 0,
            bottom: mask & 4 != 0,
            left: mask & 8 != 0,
        }
    }
}

pub fn calculate_auto_tile_index(neighbors: NeighborConfig) -> u32 {
    AUTO_TILE_TABLE[neighbors.mask() & 0xf]
}

/// A recomputed index for one existing tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileUpdate {
    pub x: i32,
    pub y: i32,
    pub tileset_id: String,
    pub layer: TileLayer,
    pub tile_index: u32,
}

impl TileUpdate {
    pub fn key(&self) -> TileKey {
        TileKey::new(self.x, self.y, self.layer, self.tileset_id.clone())
    }
}

/// Cell lookup over one layer of a tile set.
struct LayerIndex<'a> {
    layer: TileLayer,
    cells: HashMap<(i32, i32), Vec<&'a Tile>>,
}

impl<'a> LayerIndex<'a> {
    fn new(tiles: &'a [Tile], layer: TileLayer) -> Self {
        let mut cells: HashMap<(i32, i32), Vec<&'a Tile>> = HashMap::new();
        for tile in tiles.iter().filter(|t| t.layer == layer) {
            cells.entry((tile.x, tile.y)).or_default().push(tile);
        }
        for occupants in cells.values_mut() {
            occupants.sort_by(|a, b| a.tileset_id.cmp(&b.tileset_id));
        }
        Self { layer, cells }
    }

    fn at(&self, x: i32, y: i32) -> &[&'a Tile] {
        self.cells.get(&(x, y)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Terrain blends across tilesets; props only connect to their own.
    fn occupied(&self, x: i32, y: i32, tileset_id: &str) -> bool {
        let occupants = self.at(x, y);
        match self.layer {
            TileLayer::Terrain => !occupants.is_empty(),
            TileLayer::Props => occupants.iter().any(|t| t.tileset_id == tileset_id),
        }
    }

    fn neighbors(&self, x: i32, y: i32, tileset_id: &str) -> NeighborConfig {
        NeighborConfig {
            top: self.occupied(x, y - 1, tileset_id),
            bottom: self.occupied(x, y + 1, tileset_id),
            left: self.occupied(x - 1, y, tileset_id),
            right: self.occupied(x + 1, y, tileset_id),
        }
    }
}

/// Recompute indices for every tile whose neighborhood may have changed
/// after painting or erasing `(x, y)`: the four axis-aligned neighbors and,
/// with `include_self`, the cell itself.
///
/// `tiles` is the tile set after the edit. On the props layer only tiles of
/// `tileset_id` are considered.
pub fn get_tiles_to_update(
    x: i32,
    y: i32,
    tileset_id: &str,
    tiles: &[Tile],
    include_self: bool,
    layer: TileLayer,
) -> Vec<TileUpdate> {
    let index = LayerIndex::new(tiles, layer);

    let mut cells = Vec::with_capacity(5);
    if include_self {
        cells.push((x, y));
    }
    cells.extend([(x, y - 1), (x + 1, y), (x, y + 1), (x - 1, y)]);

    let mut updates = Vec::new();
    for (cx, cy) in cells {
        for tile in index.at(cx, cy) {
            if layer == TileLayer::Props && tile.tileset_id != tileset_id {
                continue;
            }
            let neighbors = index.neighbors(cx, cy, &tile.tileset_id);
            updates.push(TileUpdate {
                x: cx,
                y: cy,
                tileset_id: tile.tileset_id.clone(),
                layer,
                tile_index: calculate_auto_tile_index(neighbors),
            });
        }
    }
    updates
}

/// Operations that paint `tileset_id` at `(x, y)` and fix up neighbors.
pub fn paint_ops(tiles: &[Tile], x: i32, y: i32, tileset_id: &str, layer: TileLayer) -> Vec<BoardOp> {
    let key = TileKey::new(x, y, layer, tileset_id);
    let mut after: Vec<Tile> = tiles.iter().filter(|t| t.key() != key).cloned().collect();
    after.push(Tile::new(x, y, tileset_id, layer));

    let updates = get_tiles_to_update(x, y, tileset_id, &after, true, layer);
    let mut ops = Vec::with_capacity(updates.len());
    for update in updates {
        if update.key() == key {
            ops.insert(0, BoardOp::AddTile {
                tile: Tile::new(x, y, tileset_id, layer).with_index(update.tile_index),
            });
        } else {
            push_if_changed(&mut ops, tiles, update);
        }
    }
    ops
}

/// Operations that erase `tileset_id` at `(x, y)` and fix up neighbors.
/// Erasing an empty cell yields no operations.
pub fn erase_ops(tiles: &[Tile], x: i32, y: i32, tileset_id: &str, layer: TileLayer) -> Vec<BoardOp> {
    let key = TileKey::new(x, y, layer, tileset_id);
    if !tiles.iter().any(|t| t.key() == key) {
        return Vec::new();
    }
    let after: Vec<Tile> = tiles.iter().filter(|t| t.key() != key).cloned().collect();

    let mut ops = vec![BoardOp::DeleteTile { key }];
    for update in get_tiles_to_update(x, y, tileset_id, &after, false, layer) {
        push_if_changed(&mut ops, tiles, update);
    }
    ops
}

fn push_if_changed(ops: &mut Vec<BoardOp>, before: &[Tile], update: TileUpdate) {
    let key = update.key();
    let current = before.iter().find(|t| t.key() == key).map(|t| t.tile_index);
    if current != Some(update.tile_index) {
        ops.push(BoardOp::UpdateTile {
            key,
            tile_index: update.tile_index,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoardSnapshot;

    fn paint(snapshot: &mut BoardSnapshot, x: i32, y: i32, tileset: &str, layer: TileLayer) {
        for op in paint_ops(&snapshot.tile_list(), x, y, tileset, layer) {
            snapshot.apply(&op);
        }
    }

    fn index_at(snapshot: &BoardSnapshot, x: i32, y: i32, tileset: &str, layer: TileLayer) -> u32 {
        snapshot.tiles[&TileKey::new(x, y, layer, tileset)].tile_index
    }

    #[test]
    fn test_all_masks_match_table() {
        let expected = [4, 7, 3, 6, 1, 4, 0, 3, 5, 8, 4, 7, 2, 5, 1, 4];
        for mask in 0..16 {
            let config = NeighborConfig::from_mask(mask);
            assert_eq!(config.mask(), mask);
            assert_eq!(calculate_auto_tile_index(config), expected[mask], "mask {}", mask);
        }
    }

    #[test]
    fn test_mask_bits() {
        let east_south = NeighborConfig {
            right: true,
            bottom: true,
            ..Default::default()
        };
        assert_eq!(east_south.mask(), 6);
        assert_eq!(calculate_auto_tile_index(east_south), 0);
        assert_eq!(calculate_auto_tile_index(NeighborConfig::default()), 4);
    }

    #[test]
    fn test_grass_paint_scenario() {
        let mut board = BoardSnapshot::new();
        paint(&mut board, 0, 0, "grass", TileLayer::Terrain);
        assert_eq!(index_at(&board, 0, 0, "grass", TileLayer::Terrain), 4);

        paint(&mut board, 1, 0, "grass", TileLayer::Terrain);
        paint(&mut board, 0, 1, "grass", TileLayer::Terrain);

        assert_eq!(index_at(&board, 0, 0, "grass", TileLayer::Terrain), 0);
        // (1,0) has only west, (0,1) has only north.
        assert_eq!(index_at(&board, 1, 0, "grass", TileLayer::Terrain), 5);
        assert_eq!(index_at(&board, 0, 1, "grass", TileLayer::Terrain), 7);
    }

    #[test]
    fn test_top_is_y_minus_one() {
        let tiles = vec![
            Tile::new(0, 0, "grass", TileLayer::Terrain),
            Tile::new(0, -1, "grass", TileLayer::Terrain),
        ];
        let updates = get_tiles_to_update(0, 0, "grass", &tiles, true, TileLayer::Terrain);
        let own = updates.iter().find(|u| u.x == 0 && u.y == 0).unwrap();
        assert_eq!(own.tile_index, 7);
    }

    #[test]
    fn test_terrain_neighbors_cross_tilesets() {
        let tiles = vec![
            Tile::new(0, 0, "grass", TileLayer::Terrain),
            Tile::new(1, 0, "sand", TileLayer::Terrain),
        ];
        let updates = get_tiles_to_update(1, 0, "sand", &tiles, true, TileLayer::Terrain);

        let grass = updates.iter().find(|u| u.tileset_id == "grass").unwrap();
        assert_eq!((grass.x, grass.y), (0, 0));
        assert_eq!(grass.tile_index, 3);
        let sand = updates.iter().find(|u| u.tileset_id == "sand").unwrap();
        assert_eq!(sand.tile_index, 5);
    }

    #[test]
    fn test_props_only_same_tileset() {
        let tiles = vec![
            Tile::new(0, 0, "trees", TileLayer::Props),
            Tile::new(1, 0, "rocks", TileLayer::Props),
            Tile::new(0, 1, "trees", TileLayer::Props),
        ];
        let updates = get_tiles_to_update(0, 0, "trees", &tiles, true, TileLayer::Props);

        assert!(updates.iter().all(|u| u.tileset_id == "trees"));
        let own = updates.iter().find(|u| u.x == 0 && u.y == 0).unwrap();
        assert_eq!(own.tile_index, calculate_auto_tile_index(NeighborConfig::from_mask(4)));
    }

    #[test]
    fn test_layers_do_not_interact() {
        let tiles = vec![
            Tile::new(0, 0, "grass", TileLayer::Terrain),
            Tile::new(1, 0, "trees", TileLayer::Props),
        ];
        let updates = get_tiles_to_update(0, 0, "grass", &tiles, true, TileLayer::Terrain);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].tile_index, 4);
    }

    #[test]
    fn test_erase_recomputes_neighbors() {
        let mut board = BoardSnapshot::new();
        paint(&mut board, 0, 0, "grass", TileLayer::Terrain);
        paint(&mut board, 1, 0, "grass", TileLayer::Terrain);
        assert_eq!(index_at(&board, 0, 0, "grass", TileLayer::Terrain), 3);

        let ops = erase_ops(&board.tile_list(), 1, 0, "grass", TileLayer::Terrain);
        assert!(matches!(ops[0], BoardOp::DeleteTile { .. }));
        for op in &ops {
            board.apply(op);
        }
        assert_eq!(board.tiles.len(), 1);
        assert_eq!(index_at(&board, 0, 0, "grass", TileLayer::Terrain), 4);
    }

    #[test]
    fn test_erase_empty_cell_is_noop() {
        assert!(erase_ops(&[], 0, 0, "grass", TileLayer::Terrain).is_empty());
    }

    #[test]
    fn test_paint_skips_unchanged_neighbors() {
        let mut board = BoardSnapshot::new();
        paint(&mut board, 0, 0, "grass", TileLayer::Terrain);
        paint(&mut board, 1, 0, "grass", TileLayer::Terrain);

        // Repainting an existing cell changes nobody's neighborhood.
        let ops = paint_ops(&board.tile_list(), 1, 0, "grass", TileLayer::Terrain);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], BoardOp::AddTile { .. }));
    }
}
