use std::collections::{HashSet, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ecs::{ControlPlane, MAX_DESCRIBE_BATCH, MAX_PAGE_SIZE, cancellable};
use crate::error::EcsError;
use crate::model::{DescribedResource, ResourceKind};

#[derive(Debug, Clone, Eq, PartialEq)]
enum Phase {
    Listing {
        cursor: Option<String>,
    },
    Describing {
        pending: VecDeque<Vec<String>>,
        next_cursor: Option<String>,
    },
    Done,
}

/// Walks the list/describe protocol one remote call per `step`, merging every
/// describe batch into a single ordered, de-duplicated result.
#[derive(Debug)]
pub struct Collector {
    kind: ResourceKind,
    page_size: usize,
    describe_batch: usize,
    phase: Phase,
    seen: HashSet<String>,
    records: Vec<DescribedResource>,
}

impl Collector {
    pub fn new(kind: ResourceKind) -> Self {
        Self::with_limits(kind, MAX_PAGE_SIZE, MAX_DESCRIBE_BATCH)
    }

    pub fn with_limits(kind: ResourceKind, page_size: usize, describe_batch: usize) -> Self {
        Self {
            kind,
            page_size: page_size.max(1),
            describe_batch: describe_batch.max(1),
            phase: Phase::Listing { cursor: None },
            seen: HashSet::new(),
            records: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub async fn step<A>(&mut self, api: &A) -> Result<(), EcsError>
    where
        A: ControlPlane + ?Sized,
    {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Listing { cursor } => {
                let page = api
                    .list_identifiers(self.kind, cursor.as_deref(), self.page_size)
                    .await?;
                debug!(
                    kind = %self.kind,
                    identifiers = page.identifiers.len(),
                    more = page.next_cursor.is_some(),
                    "listed page"
                );
                if page.identifiers.is_empty() {
                    return Ok(());
                }
                let pending = page
                    .identifiers
                    .chunks(self.describe_batch)
                    .map(<[String]>::to_vec)
                    .collect();
                self.phase = Phase::Describing {
                    pending,
                    next_cursor: page.next_cursor,
                };
            }
            Phase::Describing {
                mut pending,
                next_cursor,
            } => {
                if let Some(batch) = pending.pop_front() {
                    let described = api.describe(self.kind, &batch).await?;
                    if described.len() < batch.len() {
                        debug!(
                            kind = %self.kind,
                            requested = batch.len(),
                            returned = described.len(),
                            "some resources vanished before describe"
                        );
                    }
                    merge_records(&mut self.seen, &mut self.records, described);
                }
                self.phase = if !pending.is_empty() {
                    Phase::Describing {
                        pending,
                        next_cursor,
                    }
                } else {
                    match next_cursor {
                        Some(cursor) => Phase::Listing {
                            cursor: Some(cursor),
                        },
                        None => Phase::Done,
                    }
                };
            }
            Phase::Done => {}
        }
        Ok(())
    }

    pub async fn run<A>(
        mut self,
        api: &A,
        cancel: &CancellationToken,
    ) -> Result<Vec<DescribedResource>, EcsError>
    where
        A: ControlPlane + ?Sized,
    {
        while !self.is_done() {
            cancellable(cancel, "collect resources", self.step(api)).await?;
        }
        debug!(kind = %self.kind, total = self.records.len(), "collection finished");
        Ok(self.records)
    }
}

pub async fn collect_all<A>(
    api: &A,
    kind: ResourceKind,
    cancel: &CancellationToken,
) -> Result<Vec<DescribedResource>, EcsError>
where
    A: ControlPlane + ?Sized,
{
    Collector::new(kind).run(api, cancel).await
}

/// Hydrates an explicit identifier list, batched at the describe limit.
pub async fn describe_named<A>(
    api: &A,
    kind: ResourceKind,
    identifiers: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<DescribedResource>, EcsError>
where
    A: ControlPlane + ?Sized,
{
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for batch in identifiers.chunks(MAX_DESCRIBE_BATCH) {
        let described = cancellable(cancel, "describe resources", api.describe(kind, batch)).await?;
        merge_records(&mut seen, &mut records, described);
    }
    Ok(records)
}

fn merge_records(
    seen: &mut HashSet<String>,
    records: &mut Vec<DescribedResource>,
    batch: Vec<DescribedResource>,
) {
    for record in batch {
        if seen.insert(record.identifier().to_string()) {
            records.push(record);
        }
    }
}
