//! # tessera-core: board model, CRDT board documents and autotiling
//!
//! ```text
//! ┌──────────────┐   BoardOp (local txn)   ┌──────────────────┐
//! │ collaborator │ ──────────────────────► │  BoardDocument   │
//! └──────────────┘                         │  yrs Doc         │
//!                                          │  ├─ "shapes"     │
//!        remote delta (remote txn) ──────► │  ├─ "tiles"      │
//!                                          │  └─ "sprites"    │
//!                                          └──────────────────┘
//! ```
//!
//! - [`board`]: one yrs document per board, origin-tagged transactions
//! - [`autotile`]: deterministic neighbor → tile index resolution

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod autotile;
pub mod board;

pub use autotile::{
    calculate_auto_tile_index, erase_ops, get_tiles_to_update, paint_ops, NeighborConfig,
    TileUpdate,
};
pub use board::{
    BoardDocument, BoardError, ChangeOrigin, Collection, CollectionContents, LOCAL_ORIGIN,
    REMOTE_ORIGIN,
};

/// Tile layer. Terrain tiles blend across tilesets, props never do.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TileLayer {
    #[default]
    Terrain,
    Props,
}

impl TileLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileLayer::Terrain => "terrain",
            TileLayer::Props => "props",
        }
    }
}

/// Composite identity of a tile: one value per `(x, y, layer, tileset)`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub x: i32,
    pub y: i32,
    pub layer: TileLayer,
    pub tileset_id: String,
}

impl TileKey {
    pub fn new(x: i32, y: i32, layer: TileLayer, tileset_id: impl Into<String>) -> Self {
        Self {
            x,
            y,
            layer,
            tileset_id: tileset_id.into(),
        }
    }

    /// Key string used inside the `tiles` collection.
    pub fn encode(&self) -> String {
        format!("{},{},{},{}", self.x, self.y, self.layer.as_str(), self.tileset_id)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub tileset_id: String,
    #[serde(default)]
    pub tile_index: u32,
    #[serde(default)]
    pub layer: TileLayer,
}

impl Tile {
    pub fn new(x: i32, y: i32, tileset_id: impl Into<String>, layer: TileLayer) -> Self {
        Self {
            x,
            y,
            tileset_id: tileset_id.into(),
            tile_index: 0,
            layer,
        }
    }

    pub fn with_index(mut self, tile_index: u32) -> Self {
        self.tile_index = tile_index;
        self
    }

    pub fn key(&self) -> TileKey {
        TileKey::new(self.x, self.y, self.layer, self.tileset_id.clone())
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    #[default]
    Rectangle,
    Ellipse,
    Line,
    Polygon,
    Text,
    Path,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Shape {
    pub id: String,
    #[serde(default)]
    pub kind: ShapeKind,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
    #[serde(default)]
    pub rotation: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default)]
    pub stroke_width: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub z_index: i32,
}

impl Shape {
    pub fn new(id: impl Into<String>, kind: ShapeKind, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            fill: None,
            stroke: None,
            stroke_width: 1.0,
            points: Vec::new(),
            text: None,
            z_index: 0,
        }
    }

    pub fn rect(id: impl Into<String>, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(id, ShapeKind::Rectangle, x, y, width, height)
    }
}

/// Partial shape update. `Some` fields overwrite, `None` fields are kept.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ShapePatch {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub rotation: Option<f32>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f32>,
    pub points: Option<Vec<f32>>,
    pub text: Option<String>,
    pub z_index: Option<i32>,
}

impl ShapePatch {
    pub fn position(x: f32, y: f32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn apply(&self, shape: &mut Shape) {
        if let Some(v) = self.x { shape.x = v; }
        if let Some(v) = self.y { shape.y = v; }
        if let Some(v) = self.width { shape.width = v; }
        if let Some(v) = self.height { shape.height = v; }
        if let Some(v) = self.rotation { shape.rotation = v; }
        if let Some(v) = &self.fill { shape.fill = Some(v.clone()); }
        if let Some(v) = &self.stroke { shape.stroke = Some(v.clone()); }
        if let Some(v) = self.stroke_width { shape.stroke_width = v; }
        if let Some(v) = &self.points { shape.points = v.clone(); }
        if let Some(v) = &self.text { shape.text = Some(v.clone()); }
        if let Some(v) = self.z_index { shape.z_index = v; }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Sprite {
    pub id: String,
    /// Asset id of the sprite sheet this instance draws from.
    pub sprite_id: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
    #[serde(default)]
    pub rotation: f32,
    #[serde(default)]
    pub frame: u32,
    #[serde(default)]
    pub flip_x: bool,
    #[serde(default)]
    pub flip_y: bool,
    #[serde(default)]
    pub z_index: i32,
}

impl Sprite {
    pub fn new(id: impl Into<String>, sprite_id: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id: id.into(),
            sprite_id: sprite_id.into(),
            x,
            y,
            width: 0.0,
            height: 0.0,
            rotation: 0.0,
            frame: 0,
            flip_x: false,
            flip_y: false,
            z_index: 0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SpritePatch {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub rotation: Option<f32>,
    pub frame: Option<u32>,
    pub flip_x: Option<bool>,
    pub flip_y: Option<bool>,
    pub z_index: Option<i32>,
}

impl SpritePatch {
    pub fn apply(&self, sprite: &mut Sprite) {
        if let Some(v) = self.x { sprite.x = v; }
        if let Some(v) = self.y { sprite.y = v; }
        if let Some(v) = self.width { sprite.width = v; }
        if let Some(v) = self.height { sprite.height = v; }
        if let Some(v) = self.rotation { sprite.rotation = v; }
        if let Some(v) = self.frame { sprite.frame = v; }
        if let Some(v) = self.flip_x { sprite.flip_x = v; }
        if let Some(v) = self.flip_y { sprite.flip_y = v; }
        if let Some(v) = self.z_index { sprite.z_index = v; }
    }
}

/// A single board mutation. Batches of these run in one transaction.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BoardOp {
    AddShape { shape: Shape },
    UpdateShape { id: String, patch: ShapePatch },
    DeleteShape { id: String },
    AddTile { tile: Tile },
    UpdateTile { key: TileKey, tile_index: u32 },
    DeleteTile { key: TileKey },
    AddSprite { sprite: Sprite },
    UpdateSprite { id: String, patch: SpritePatch },
    DeleteSprite { id: String },
}

/// Plain-data view of a board: what collaborators render.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoardSnapshot {
    pub shapes: BTreeMap<String, Shape>,
    pub tiles: BTreeMap<TileKey, Tile>,
    pub sprites: BTreeMap<String, Sprite>,
}

impl BoardSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(shapes: Vec<Shape>, tiles: Vec<Tile>, sprites: Vec<Sprite>) -> Self {
        Self {
            shapes: shapes.into_iter().map(|s| (s.id.clone(), s)).collect(),
            tiles: tiles.into_iter().map(|t| (t.key(), t)).collect(),
            sprites: sprites.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty() && self.tiles.is_empty() && self.sprites.is_empty()
    }

    pub fn tile_list(&self) -> Vec<Tile> {
        self.tiles.values().cloned().collect()
    }

    /// Apply an operation to the plain view, mirroring what the document does.
    pub fn apply(&mut self, op: &BoardOp) {
        match op {
            BoardOp::AddShape { shape } => {
                self.shapes.insert(shape.id.clone(), shape.clone());
            }
            BoardOp::UpdateShape { id, patch } => {
                if let Some(shape) = self.shapes.get_mut(id) {
                    patch.apply(shape);
                }
            }
            BoardOp::DeleteShape { id } => {
                self.shapes.remove(id);
            }
            BoardOp::AddTile { tile } => {
                self.tiles.insert(tile.key(), tile.clone());
            }
            BoardOp::UpdateTile { key, tile_index } => {
                if let Some(tile) = self.tiles.get_mut(key) {
                    tile.tile_index = *tile_index;
                }
            }
            BoardOp::DeleteTile { key } => {
                self.tiles.remove(key);
            }
            BoardOp::AddSprite { sprite } => {
                self.sprites.insert(sprite.id.clone(), sprite.clone());
            }
            BoardOp::UpdateSprite { id, patch } => {
                if let Some(sprite) = self.sprites.get_mut(id) {
                    patch.apply(sprite);
                }
            }
            BoardOp::DeleteSprite { id } => {
                self.sprites.remove(id);
            }
        }
    }

    /// Replace one collection wholesale with projected contents.
    pub fn replace(&mut self, contents: &CollectionContents) {
        match contents {
            CollectionContents::Shapes(shapes) => {
                self.shapes = shapes.iter().map(|s| (s.id.clone(), s.clone())).collect();
            }
            CollectionContents::Tiles(tiles) => {
                self.tiles = tiles.iter().map(|t| (t.key(), t.clone())).collect();
            }
            CollectionContents::Sprites(sprites) => {
                self.sprites = sprites.iter().map(|s| (s.id.clone(), s.clone())).collect();
            }
        }
    }
}
