use crate::tracking::WriteSet;
use crate::types::{Key, MVMemory, Order, ParentStore, TxIndex, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Overlay {
    Value(Value),
    Deleted,
    Estimate(TxIndex),
}

/// Speculative view of `[start, end)` for a reader at `before`: the latest
/// lower-index writes, shadowed by `own` writes of the reader itself.
pub fn overlay_for<M: MVMemory + ?Sized>(
    mv: &M,
    before: TxIndex,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    own: &WriteSet,
) -> BTreeMap<Key, Overlay> {
    let mut overlay: BTreeMap<Key, Overlay> = mv
        .collect_iterator_items(before, start, end)
        .into_iter()
        .map(|(key, item)| {
            let entry = if item.is_estimate {
                Overlay::Estimate(item.tx_index)
            } else {
                match item.value {
                    Some(value) => Overlay::Value(value),
                    None => Overlay::Deleted,
                }
            };
            (key, entry)
        })
        .collect();
    for (key, value) in own {
        let in_range = start.map_or(true, |s| key.as_slice() >= s)
            && end.map_or(true, |e| key.as_slice() < e);
        if in_range {
            let entry = match value {
                Some(value) => Overlay::Value(value.clone()),
                None => Overlay::Deleted,
            };
            overlay.insert(key.clone(), entry);
        }
    }
    overlay
}

type Source<'a, T> = Peekable<Box<dyn Iterator<Item = (Key, T)> + 'a>>;

/// Yields live entries in `order`; an estimate surfaces as `Err((key, writer))`.
pub struct MergeIter<'a> {
    parent: Source<'a, Value>,
    overlay: Source<'a, Overlay>,
    order: Order,
}

impl<'a> MergeIter<'a> {
    pub fn new<P: ParentStore + ?Sized>(
        parent: &'a P,
        overlay: BTreeMap<Key, Overlay>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
    ) -> Self {
        let (parent, overlay): (Box<dyn Iterator<Item = (Key, Value)> + 'a>, Box<dyn Iterator<Item = (Key, Overlay)> + 'a>) =
            match order {
                Order::Ascending => (parent.iterator(start, end), Box::new(overlay.into_iter())),
                Order::Descending => (
                    parent.reverse_iterator(start, end),
                    Box::new(overlay.into_iter().rev()),
                ),
            };
        MergeIter {
            parent: parent.peekable(),
            overlay: overlay.peekable(),
            order,
        }
    }

    fn pick(&mut self) -> Option<Ordering> {
        match (self.parent.peek(), self.overlay.peek()) {
            (None, None) => None,
            (Some(_), None) => Some(Ordering::Less),
            (None, Some(_)) => Some(Ordering::Greater),
            (Some((pk, _)), Some((ok, _))) => Some(match self.order {
                Order::Ascending => pk.cmp(ok),
                Order::Descending => ok.cmp(pk),
            }),
        }
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Result<(Key, Value), (Key, TxIndex)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.pick()? {
                Ordering::Less => return self.parent.next().map(Ok),
                Ordering::Equal => {
                    // overlay shadows the parent
                    self.parent.next();
                    self.overlay.next()?
                }
                Ordering::Greater => self.overlay.next()?,
            };
            match entry {
                (key, Overlay::Value(value)) => return Some(Ok((key, value))),
                (_, Overlay::Deleted) => continue,
                (key, Overlay::Estimate(writer)) => return Some(Err((key, writer))),
            }
        }
    }
}
