/// Page partitioning of an asset listing

use crate::state::AssetId;
use std::collections::HashSet;
use std::num::NonZeroUsize;

/// One contiguous slice of the listing, processed and reported as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub index: usize,
    pub assets: Vec<AssetId>,
}

impl Page {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Drop repeated identities, keeping the first occurrence and the order
pub fn dedupe(ids: Vec<AssetId>) -> Vec<AssetId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Split `assets` into `ceil(len / page_size)` pages, preserving order
pub fn partition(assets: Vec<AssetId>, page_size: NonZeroUsize) -> Vec<Page> {
    let page_size = page_size.get();
    let mut pages = Vec::with_capacity(assets.len().div_ceil(page_size));
    let mut rest = assets.into_iter().peekable();
    while rest.peek().is_some() {
        pages.push(Page {
            index: pages.len(),
            assets: rest.by_ref().take(page_size).collect(),
        });
    }
    pages
}
