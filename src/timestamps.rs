// ABOUTME: Timestamp store - last synced version tokens per table and side
// ABOUTME: Loads and saves the TABLENAME,0xHEX text files between runs

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs;

use crate::token::VersionToken;

const SOURCE_TOKENS_FILE: &str = "source-tokens.txt";
const TARGET_TOKENS_FILE: &str = "target-tokens.txt";

/// Which database a stored token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSide {
    Source,
    Target,
}

impl TokenSide {
    pub fn file_name(&self) -> &'static str {
        match self {
            TokenSide::Source => SOURCE_TOKENS_FILE,
            TokenSide::Target => TARGET_TOKENS_FILE,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct TokenMaps {
    source: BTreeMap<String, VersionToken>,
    target: BTreeMap<String, VersionToken>,
}

impl TokenMaps {
    fn side(&self, side: TokenSide) -> &BTreeMap<String, VersionToken> {
        match side {
            TokenSide::Source => &self.source,
            TokenSide::Target => &self.target,
        }
    }

    fn side_mut(&mut self, side: TokenSide) -> &mut BTreeMap<String, VersionToken> {
        match side {
            TokenSide::Source => &mut self.source,
            TokenSide::Target => &mut self.target,
        }
    }
}

/// Stored tokens for every table, one map per side.
///
/// Shared between table workers behind an `Arc`; every method takes `&self`.
/// Tokens for a table are only written after that table's transaction has
/// committed, so the files never run ahead of the data.
#[derive(Debug, Default)]
pub struct TimestampStore {
    maps: RwLock<TokenMaps>,
}

impl TimestampStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TokenMaps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TokenMaps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, table: &str, side: TokenSide) -> Option<VersionToken> {
        self.read().side(side).get(&normalize(table)).copied()
    }

    /// Record both tokens for a table after a committed sync.
    pub fn set(&self, table: &str, source: VersionToken, target: VersionToken) {
        let key = normalize(table);
        let mut maps = self.write();
        maps.source.insert(key.clone(), source);
        maps.target.insert(key, target);
    }

    /// Forget a table; its next sync will be a full reload.
    pub fn clear(&self, table: &str) -> bool {
        let key = normalize(table);
        let mut maps = self.write();
        let had_source = maps.source.remove(&key).is_some();
        let had_target = maps.target.remove(&key).is_some();
        had_source || had_target
    }

    pub fn clear_all(&self) {
        let mut maps = self.write();
        maps.source.clear();
        maps.target.clear();
    }

    /// Tables with at least one stored token, sorted.
    pub fn tables(&self) -> Vec<String> {
        let maps = self.read();
        let mut tables: Vec<String> = maps
            .source
            .keys()
            .chain(maps.target.keys())
            .cloned()
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }

    /// Merge one side's text blob into the store, returning how many lines
    /// were accepted. Malformed lines are skipped.
    pub fn load_from_text(&self, side: TokenSide, blob: &str) -> usize {
        let mut maps = self.write();
        let map = maps.side_mut(side);
        let mut loaded = 0;
        for line in blob.lines() {
            match parse_line(line) {
                Some((table, token)) => {
                    map.insert(table, token);
                    loaded += 1;
                }
                None if line.trim().is_empty() => {}
                None => tracing::debug!("Skipping malformed token line: {:?}", line),
            }
        }
        loaded
    }

    /// Render one side as `TABLENAME,0xHEX` lines, sorted by table.
    pub fn to_text(&self, side: TokenSide) -> String {
        self.read()
            .side(side)
            .iter()
            .map(|(table, token)| format!("{},{}\n", table, token.to_hex()))
            .collect()
    }

    /// Load both token files from `dir`. Missing files mean no stored tokens.
    pub async fn load(dir: &Path) -> Result<Self> {
        let store = Self::new();
        for side in [TokenSide::Source, TokenSide::Target] {
            let path = dir.join(side.file_name());
            if !fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read stored tokens from {:?}", path))?;
            let loaded = store.load_from_text(side, &contents);
            tracing::debug!("Loaded {} stored tokens from {:?}", loaded, path);
        }
        Ok(store)
    }

    /// Write both token files into `dir`, creating it when needed.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {:?}", dir))?;

        for side in [TokenSide::Source, TokenSide::Target] {
            let path = dir.join(side.file_name());
            let contents = self.to_text(side);
            fs::write(&path, contents)
                .await
                .with_context(|| format!("Failed to write stored tokens to {:?}", path))?;
        }
        Ok(())
    }

    /// Default state directory, relative to the working directory.
    pub fn default_dir() -> PathBuf {
        PathBuf::from(".delta-replicator")
    }
}

fn normalize(table: &str) -> String {
    table.trim().to_ascii_uppercase()
}

fn parse_line(line: &str) -> Option<(String, VersionToken)> {
    let (table, token) = line.split_once(',')?;
    let table = normalize(table);
    if table.is_empty() {
        return None;
    }
    let token = VersionToken::parse_hex(token).ok()?;
    Some((table, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_is_case_insensitive() {
        let store = TimestampStore::new();
        store.set(
            "CustTable",
            VersionToken::from_u64(10),
            VersionToken::from_u64(20),
        );
        assert_eq!(
            store.get("CUSTTABLE", TokenSide::Source),
            Some(VersionToken::from_u64(10))
        );
        assert_eq!(
            store.get("custtable", TokenSide::Target),
            Some(VersionToken::from_u64(20))
        );
        assert_eq!(store.get("SalesLine", TokenSide::Source), None);
    }

    #[test]
    fn test_clear_and_clear_all() {
        let store = TimestampStore::new();
        store.set("A", VersionToken::from_u64(1), VersionToken::from_u64(2));
        store.set("B", VersionToken::from_u64(3), VersionToken::from_u64(4));

        assert!(store.clear("a"));
        assert!(!store.clear("a"));
        assert_eq!(store.get("A", TokenSide::Source), None);
        assert_eq!(store.tables(), vec!["B".to_string()]);

        store.clear_all();
        assert!(store.tables().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let store = TimestampStore::new();
        let blob = "CUSTTABLE,0x00000000000007D0\n\
                    garbage\n\
                    SALESLINE,0x12\n\
                    ,0x0000000000000001\n\
                    \n\
                    inventtrans,0X00000000000000ff\n";
        assert_eq!(store.load_from_text(TokenSide::Source, blob), 2);
        assert_eq!(
            store.get("INVENTTRANS", TokenSide::Source),
            Some(VersionToken::from_u64(0xFF))
        );
        assert_eq!(store.get("SALESLINE", TokenSide::Source), None);
    }

    #[test]
    fn test_round_trip_ignores_line_order() {
        let store = TimestampStore::new();
        store.load_from_text(
            TokenSide::Target,
            "ZETA,0x0000000000000002\nALPHA,0x0000000000000001\n",
        );
        let text = store.to_text(TokenSide::Target);
        assert_eq!(text, "ALPHA,0x0000000000000001\nZETA,0x0000000000000002\n");

        let reloaded = TimestampStore::new();
        reloaded.load_from_text(TokenSide::Target, &text);
        assert_eq!(reloaded.to_text(TokenSide::Target), text);
    }

    #[test]
    fn test_sides_are_independent() {
        let store = TimestampStore::new();
        store.load_from_text(TokenSide::Source, "A,0x0000000000000001\n");
        assert_eq!(store.get("A", TokenSide::Target), None);
        assert_eq!(store.to_text(TokenSide::Target), "");
    }
}
