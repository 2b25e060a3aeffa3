//! Resolves a target selector into the topics covering its targets

use std::collections::BTreeSet;
use std::future::Future;

use dt_common::model::{MatchResult, Selector};
use tracing::debug;

use crate::errors::{ManagerError, StorageError};
use crate::storage::model::{Page, SearchPage};
use crate::storage::Storage;

/// Targets read per search page
pub const PAGE_SIZE: usize = 100;

/// Compute the covering set of a selector against the target registry
pub async fn match_targets(
    storage: &dyn Storage,
    selector: &Selector,
) -> Result<MatchResult, ManagerError> {
    if selector.is_empty() {
        return Ok(MatchResult::default());
    }
    collect_pages(|page| storage.search_targets(selector, page)).await
}

/// Read search pages until every hit is seen. Any page error discards the
/// partial result.
pub async fn collect_pages<F, Fut>(mut search: F) -> Result<MatchResult, ManagerError>
where
    F: FnMut(Page) -> Fut,
    Fut: Future<Output = Result<SearchPage, StorageError>>,
{
    let mut list = Vec::new();
    let mut ids = BTreeSet::new();
    let mut tags = BTreeSet::new();

    for page in 1.. {
        let result = search(Page::new(page, PAGE_SIZE)).await?;
        if result.hits.is_empty() {
            break;
        }
        for hit in result.hits {
            match hit.matched_tag {
                Some(tag) => {
                    tags.insert(tag);
                }
                None => {
                    ids.insert(hit.id.clone());
                }
            }
            list.push(hit.id);
        }
        if list.len() >= result.total {
            break;
        }
    }

    debug!(
        "Matched {} target(s) through {} tag(s) and {} id(s)",
        list.len(),
        tags.len(),
        ids.len()
    );
    Ok(MatchResult {
        list,
        ids: ids.into_iter().collect(),
        tags: tags.into_iter().collect(),
    })
}
