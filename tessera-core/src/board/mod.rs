//! Per-board CRDT document.
//!
//! A `BoardDocument` wraps one yrs `Doc` holding three maps: `shapes` keyed by
//! shape id, `tiles` keyed by the encoded [`TileKey`], and `sprites` keyed by
//! sprite id. Values are JSON strings, one per key, so concurrent writes to the
//! same key resolve last-writer-wins and replicas converge.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use crate::{BoardOp, BoardSnapshot, Shape, Sprite, Tile, TileKey};

/// Transaction origin for mutations made through this replica's API.
pub const LOCAL_ORIGIN: &str = "local";
/// Transaction origin for deltas received from the network.
pub const REMOTE_ORIGIN: &str = "remote";

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("document observer unavailable: {0}")]
    ObserverUnavailable(String),
}

/// Who produced the transaction an observer is seeing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    Other,
}

impl ChangeOrigin {
    fn of(txn: &TransactionMut) -> Self {
        match txn.origin() {
            Some(origin) if *origin == Origin::from(LOCAL_ORIGIN) => ChangeOrigin::Local,
            Some(origin) if *origin == Origin::from(REMOTE_ORIGIN) => ChangeOrigin::Remote,
            _ => ChangeOrigin::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Shapes,
    Tiles,
    Sprites,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Shapes, Collection::Tiles, Collection::Sprites];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Shapes => "shapes",
            Collection::Tiles => "tiles",
            Collection::Sprites => "sprites",
        }
    }
}

/// Full decoded contents of one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionContents {
    Shapes(Vec<Shape>),
    Tiles(Vec<Tile>),
    Sprites(Vec<Sprite>),
}

impl CollectionContents {
    pub fn collection(&self) -> Collection {
        match self {
            CollectionContents::Shapes(_) => Collection::Shapes,
            CollectionContents::Tiles(_) => Collection::Tiles,
            CollectionContents::Sprites(_) => Collection::Sprites,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CollectionContents::Shapes(v) => v.len(),
            CollectionContents::Tiles(v) => v.len(),
            CollectionContents::Sprites(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BoardDocument {
    board_id: String,
    doc: Doc,
    shapes: MapRef,
    tiles: MapRef,
    sprites: MapRef,
}

impl BoardDocument {
    pub fn new(board_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let shapes = doc.get_or_insert_map(Collection::Shapes.name());
        let tiles = doc.get_or_insert_map(Collection::Tiles.name());
        let sprites = doc.get_or_insert_map(Collection::Sprites.name());

        Self {
            board_id: board_id.into(),
            doc,
            shapes,
            tiles,
            sprites,
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    fn map(&self, collection: Collection) -> &MapRef {
        match collection {
            Collection::Shapes => &self.shapes,
            Collection::Tiles => &self.tiles,
            Collection::Sprites => &self.sprites,
        }
    }

    /// True when all three collections are empty.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        Collection::ALL
            .iter()
            .all(|c| self.map(*c).len(&txn) == 0)
    }

    /// Apply a batch of operations in a single `"local"` transaction.
    ///
    /// Updates to keys that do not exist are skipped.
    pub fn apply(&self, ops: &[BoardOp]) -> Result<(), BoardError> {
        let mut encoded = Vec::with_capacity(ops.len());
        for op in ops {
            encoded.push(match op {
                BoardOp::AddShape { shape } => Some(serde_json::to_string(shape)?),
                BoardOp::AddTile { tile } => Some(serde_json::to_string(tile)?),
                BoardOp::AddSprite { sprite } => Some(serde_json::to_string(sprite)?),
                _ => None,
            });
        }

        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        for (op, json) in ops.iter().zip(encoded) {
            match op {
                BoardOp::AddShape { shape } => {
                    self.shapes.insert(&mut txn, shape.id.as_str(), json.unwrap_or_default());
                }
                BoardOp::AddTile { tile } => {
                    self.tiles.insert(&mut txn, tile.key().encode(), json.unwrap_or_default());
                }
                BoardOp::AddSprite { sprite } => {
                    self.sprites.insert(&mut txn, sprite.id.as_str(), json.unwrap_or_default());
                }
                BoardOp::UpdateShape { id, patch } => {
                    match read_value::<Shape, _>(&self.shapes, &txn, id) {
                        Some(mut shape) => {
                            patch.apply(&mut shape);
                            self.shapes.insert(&mut txn, id.as_str(), serde_json::to_string(&shape)?);
                        }
                        None => log::debug!("[{}] update for missing shape {}", self.board_id, id),
                    }
                }
                BoardOp::UpdateTile { key, tile_index } => {
                    let encoded_key = key.encode();
                    match read_value::<Tile, _>(&self.tiles, &txn, &encoded_key) {
                        Some(mut tile) => {
                            tile.tile_index = *tile_index;
                            self.tiles.insert(&mut txn, encoded_key, serde_json::to_string(&tile)?);
                        }
                        None => log::debug!("[{}] update for missing tile {}", self.board_id, key),
                    }
                }
                BoardOp::UpdateSprite { id, patch } => {
                    match read_value::<Sprite, _>(&self.sprites, &txn, id) {
                        Some(mut sprite) => {
                            patch.apply(&mut sprite);
                            self.sprites.insert(&mut txn, id.as_str(), serde_json::to_string(&sprite)?);
                        }
                        None => log::debug!("[{}] update for missing sprite {}", self.board_id, id),
                    }
                }
                BoardOp::DeleteShape { id } => {
                    self.shapes.remove(&mut txn, id);
                }
                BoardOp::DeleteTile { key } => {
                    self.tiles.remove(&mut txn, &key.encode());
                }
                BoardOp::DeleteSprite { id } => {
                    self.sprites.remove(&mut txn, id);
                }
            }
        }
        Ok(())
    }

    /// Make the document match `snapshot` in one local transaction.
    ///
    /// Keys whose stored JSON already matches are left alone, keys missing from
    /// the snapshot are removed.
    pub fn replace_with(&self, snapshot: &BoardSnapshot) -> Result<(), BoardError> {
        let shapes = encode_entries(snapshot.shapes.values().map(|s| (s.id.clone(), s)))?;
        let tiles = encode_entries(snapshot.tiles.iter().map(|(k, t)| (k.encode(), t)))?;
        let sprites = encode_entries(snapshot.sprites.values().map(|s| (s.id.clone(), s)))?;

        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        sync_map(&self.shapes, &mut txn, shapes);
        sync_map(&self.tiles, &mut txn, tiles);
        sync_map(&self.sprites, &mut txn, sprites);
        Ok(())
    }

    /// Apply a binary delta from the network under the `"remote"` origin.
    ///
    /// The delta is decoded before any transaction opens; an undecodable
    /// delta returns an error and the document is unchanged.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), BoardError> {
        let update = Update::decode_v1(update).map_err(|e| BoardError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| BoardError::Apply(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, BoardError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| BoardError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn shapes(&self) -> Vec<Shape> {
        read_all(&self.shapes, &self.doc.transact())
    }

    pub fn tiles(&self) -> Vec<Tile> {
        read_all(&self.tiles, &self.doc.transact())
    }

    pub fn sprites(&self) -> Vec<Sprite> {
        read_all(&self.sprites, &self.doc.transact())
    }

    pub fn tile(&self, key: &TileKey) -> Option<Tile> {
        read_value(&self.tiles, &self.doc.transact(), &key.encode())
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let txn = self.doc.transact();
        BoardSnapshot::from_parts(
            read_all(&self.shapes, &txn),
            read_all(&self.tiles, &txn),
            read_all(&self.sprites, &txn),
        )
    }

    /// Observe every committed change as a v1 update, tagged by origin.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription, BoardError>
    where
        F: Fn(ChangeOrigin, &[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                callback(ChangeOrigin::of(txn), &event.update);
            })
            .map_err(|e| BoardError::ObserverUnavailable(e.to_string()))
    }

    /// Observe one collection. The callback receives the full decoded
    /// contents after every transaction that touched it.
    pub fn observe_collection<F>(&self, collection: Collection, callback: F) -> Subscription
    where
        F: Fn(ChangeOrigin, CollectionContents) + Send + Sync + 'static,
    {
        let map = self.map(collection).clone();
        self.map(collection).observe(move |txn, _event| {
            let contents = match collection {
                Collection::Shapes => CollectionContents::Shapes(read_all(&map, txn)),
                Collection::Tiles => CollectionContents::Tiles(read_all(&map, txn)),
                Collection::Sprites => CollectionContents::Sprites(read_all(&map, txn)),
            };
            callback(ChangeOrigin::of(txn), contents);
        })
    }
}

impl std::fmt::Debug for BoardDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let txn = self.doc.transact();
        f.debug_struct("BoardDocument")
            .field("board_id", &self.board_id)
            .field("shapes", &self.shapes.len(&txn))
            .field("tiles", &self.tiles.len(&txn))
            .field("sprites", &self.sprites.len(&txn))
            .finish()
    }
}

fn as_json(value: &Out) -> Option<&str> {
    match value {
        Out::Any(Any::String(s)) => Some(s.as_ref()),
        _ => None,
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Out) -> Option<T> {
    let Some(json) = as_json(value) else {
        log::warn!("skipping non-string entry {}", key);
        return None;
    };
    match serde_json::from_str(json) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("skipping undecodable entry {}: {}", key, e);
            None
        }
    }
}

fn read_value<T: DeserializeOwned, R: ReadTxn>(map: &MapRef, txn: &R, key: &str) -> Option<T> {
    map.get(txn, key).and_then(|v| decode(key, &v))
}

fn read_all<T: DeserializeOwned, R: ReadTxn>(map: &MapRef, txn: &R) -> Vec<T> {
    map.iter(txn).filter_map(|(k, v)| decode(k, &v)).collect()
}

fn encode_entries<'a, T, I>(entries: I) -> Result<Vec<(String, String)>, BoardError>
where
    T: Serialize + 'a,
    I: Iterator<Item = (String, &'a T)>,
{
    entries
        .map(|(k, v)| Ok((k, serde_json::to_string(v)?)))
        .collect()
}

fn sync_map(map: &MapRef, txn: &mut TransactionMut, entries: Vec<(String, String)>) {
    let wanted: std::collections::HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
    let stale: Vec<String> = map
        .keys(&*txn)
        .filter(|k| !wanted.contains(k))
        .map(str::to_string)
        .collect();
    for key in stale {
        map.remove(txn, &key);
    }
    for (key, json) in entries {
        let unchanged = map
            .get(&*txn, &key)
            .map(|v| as_json(&v) == Some(json.as_str()))
            .unwrap_or(false);
        if !unchanged {
            map.insert(txn, key, json);
        }
    }
}
