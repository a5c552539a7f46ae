// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinning client buffers in bounded batches.

use crate::PAGE_SIZE64;
use crate::PageHandle;
use crate::PagePinner;
use crate::PinError;
use std::sync::Arc;

/// Pages pinned for one buffer. When dropped, the pages are unpinned.
pub struct PinnedPages {
    pages: Vec<PageHandle>,
    pinner: Arc<dyn PagePinner>,
}

impl std::fmt::Debug for PinnedPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPages")
            .field("count", &self.pages.len())
            .finish()
    }
}

impl PinnedPages {
    /// The number of pinned pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// The pinned pages, in buffer order.
    pub fn pages(&self) -> &[PageHandle] {
        &self.pages
    }

    /// The page frame numbers of the pinned pages, in buffer order.
    pub fn pfns(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.iter().map(|page| page.pfn())
    }

    /// The physical address of each pinned page, in buffer order.
    pub fn physical_addresses(&self) -> Vec<u64> {
        self.pages.iter().map(PageHandle::physical_address).collect()
    }

    /// Unpins the pages, reporting platform failures.
    pub fn unpin(mut self) -> anyhow::Result<()> {
        self.unpin_inner()
    }

    fn unpin_inner(&mut self) -> anyhow::Result<()> {
        let pages = std::mem::take(&mut self.pages);
        if pages.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = pages.len(), "unpinning pages");
        self.pinner.unpin_pages(pages)
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        if let Err(err) = self.unpin_inner() {
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "failed to unpin pages"
            );
        }
    }
}

/// Pins the pages covering `[user_address, user_address + byte_size)`,
/// asking the pinner for at most `batch_pages` pages per call.
///
/// Either the whole range is pinned or nothing is: if any batch fails, or the
/// mapping ends early, every page pinned so far is unpinned again before the
/// error is returned.
pub fn pin(
    pinner: &Arc<dyn PagePinner>,
    user_address: u64,
    byte_size: u64,
    batch_pages: usize,
) -> Result<PinnedPages, PinError> {
    assert!(batch_pages > 0);
    let expected = byte_size.div_ceil(PAGE_SIZE64) as usize;

    let mut pages = Vec::new();
    pages
        .try_reserve_exact(expected)
        .map_err(|_| PinError::OutOfMemory(expected))?;

    // Anything pinned below is released by this guard's drop on failure.
    let mut pinned = PinnedPages {
        pages,
        pinner: pinner.clone(),
    };

    let mut start = user_address;
    let mut failure = None;
    while pinned.pages.len() < expected {
        let count = batch_pages.min(expected - pinned.pages.len());
        match pinner.pin_pages(start, count) {
            Ok(batch) if batch.is_empty() => {
                tracing::debug!(start, "reached end of mapping while pinning");
                break;
            }
            Ok(batch) => {
                let n = batch.len();
                tracing::trace!(start, requested = count, pinned = n, "pinned batch");
                pinned.pages.extend(batch);
                if n > count {
                    failure = Some(anyhow::anyhow!(
                        "pinner returned {n} pages for a request of {count}"
                    ));
                    break;
                }
                match start.checked_add(n as u64 * PAGE_SIZE64) {
                    Some(next) => start = next,
                    None => {
                        tracing::debug!(start, "reached end of address space while pinning");
                        break;
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    start,
                    pinned = pinned.pages.len(),
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to pin pages"
                );
                failure = Some(err);
                break;
            }
        }
    }

    let count = pinned.pages.len();
    if let Some(source) = failure {
        drop(pinned);
        return Err(PinError::Failed {
            pinned: count,
            expected,
            source,
        });
    }
    if count < expected {
        tracing::error!(pinned = count, expected, "insufficient pages pinned");
        drop(pinned);
        return Err(PinError::Incomplete {
            pinned: count,
            expected,
        });
    }

    for (i, page) in pinned.pages.iter().take(5).enumerate() {
        tracing::debug!(
            page = i,
            physical_address = page.physical_address(),
            "pinned page"
        );
    }

    Ok(pinned)
}
