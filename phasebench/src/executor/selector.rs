//! Per-terminal transaction selection for one phase.

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Picks the next transaction type, returned as its position in the registry.
///
/// Weighted phases keep a cumulative weight table and take one uniform draw per request;
/// a zero weight can never be drawn. Serial phases cycle the enabled positions in
/// ascending id order. Supplemental types are never part of the mix.
pub(crate) struct TransactionSelector {
    cumulative: Vec<(usize, f64)>,
    total: f64,
    serial: Option<SerialCursor>,
}

struct SerialCursor {
    order: Vec<usize>,
    next: usize,
}

impl TransactionSelector {
    /// `enabled[i]` is false for positions that must never be selected.
    pub(crate) fn new(weights: &[f64], enabled: &[bool], serial: bool) -> Self {
        let mut total = 0.0;
        let mut cumulative = Vec::with_capacity(weights.len());
        for (position, weight) in weights.iter().enumerate() {
            if *weight > 0.0 && enabled.get(position).copied().unwrap_or(true) {
                total += weight;
                cumulative.push((position, total));
            }
        }
        let serial = serial.then(|| SerialCursor {
            order: cumulative.iter().map(|(p, _)| *p).collect(),
            next: 0,
        });
        Self {
            cumulative,
            total,
            serial,
        }
    }

    /// Next position, avoiding `exclude` when any other choice exists.
    pub(crate) fn next(&mut self, rng: &mut StdRng, exclude: Option<usize>) -> Option<usize> {
        if let Some(cursor) = &mut self.serial {
            let position = *cursor.order.get(cursor.next)?;
            cursor.next = (cursor.next + 1) % cursor.order.len();
            return Some(position);
        }

        let excluded_weight = exclude
            .and_then(|e| self.weight_of(e))
            .filter(|w| self.total - w > 0.0);
        let total = self.total - excluded_weight.unwrap_or(0.0);
        if total <= 0.0 {
            return None;
        }

        let draw = rng.gen_range(0.0..total);
        let mut running = 0.0;
        let mut last = None;
        for (position, weight) in self.weights() {
            if excluded_weight.is_some() && Some(position) == exclude {
                continue;
            }
            running += weight;
            last = Some(position);
            if draw < running {
                return Some(position);
            }
        }
        // floating point rounding can leave the draw a hair above the final sum
        last
    }

    fn weights(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        let mut previous = 0.0;
        self.cumulative.iter().map(move |(position, cumulative)| {
            let weight = cumulative - previous;
            previous = *cumulative;
            (*position, weight)
        })
    }

    fn weight_of(&self, position: usize) -> Option<f64> {
        self.weights().find(|(p, _)| *p == position).map(|(_, w)| w)
    }

    /// Number of positions this selector can produce.
    pub(crate) fn len(&self) -> usize {
        self.cumulative.len()
    }
}

/// Seeded generator for one terminal, or an entropy-seeded one.
pub(crate) fn terminal_rng(seed: Option<u64>, benchmark: &str, terminal: usize) -> StdRng {
    match seed {
        Some(seed) => {
            let salt = benchmark
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                    (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
                });
            StdRng::seed_from_u64(seed ^ salt ^ (terminal as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
        }
        None => StdRng::from_entropy(),
    }
}
