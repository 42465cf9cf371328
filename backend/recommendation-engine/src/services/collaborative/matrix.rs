// ============================================
// User x Item Interaction Matrix
// ============================================
//
// Sparse weight maps in both directions plus per-item squared norms, so
// item-item cosine similarity only touches co-rated pairs.
//
//   events --(max fold)--> user -> {item: w} --(transpose)--> item -> {user: w}

use crate::models::InteractionEvent;
use std::collections::HashMap;
use uuid::Uuid;

pub type Neighbors = Vec<(Uuid, f64)>;

#[derive(Debug, Clone, Default)]
pub struct InteractionMatrix {
    user_items: HashMap<Uuid, HashMap<Uuid, f64>>,
    item_users: HashMap<Uuid, HashMap<Uuid, f64>>,
    item_norms: HashMap<Uuid, f64>,
}

impl InteractionMatrix {
    /// Repeated signals on one (user, item) pair keep the strongest weight
    pub fn from_events(events: &[InteractionEvent]) -> Self {
        let mut user_items: HashMap<Uuid, HashMap<Uuid, f64>> = HashMap::new();
        for event in events {
            let weight = event.kind.weight();
            let slot = user_items
                .entry(event.user_id)
                .or_default()
                .entry(event.item_id)
                .or_insert(0.0);
            *slot = slot.max(weight);
        }

        let mut item_users: HashMap<Uuid, HashMap<Uuid, f64>> = HashMap::new();
        for (user, items) in &user_items {
            for (item, weight) in items {
                item_users.entry(*item).or_default().insert(*user, *weight);
            }
        }

        let item_norms = item_users
            .iter()
            .map(|(item, users)| (*item, users.values().map(|w| w * w).sum()))
            .collect();

        Self {
            user_items,
            item_users,
            item_norms,
        }
    }

    pub fn user_count(&self) -> usize {
        self.user_items.len()
    }

    pub fn item_count(&self) -> usize {
        self.item_users.len()
    }

    /// Item ids in a stable order
    pub fn items(&self) -> Vec<Uuid> {
        let mut items: Vec<Uuid> = self.item_users.keys().copied().collect();
        items.sort();
        items
    }

    pub fn user_items(&self, user_id: Uuid) -> Option<&HashMap<Uuid, f64>> {
        self.user_items.get(&user_id)
    }

    pub fn item_users(&self, item_id: Uuid) -> Option<&HashMap<Uuid, f64>> {
        self.item_users.get(&item_id)
    }

    /// Cosine similarity and co-rater count of two items
    pub fn similarity(&self, a: Uuid, b: Uuid) -> (f64, usize) {
        match (self.item_users.get(&a), self.item_users.get(&b)) {
            (Some(ua), Some(ub)) => cosine(ua, ub),
            _ => (0.0, 0),
        }
    }

    /// Top-`top_n` positive neighbours of `item` among items sharing at least
    /// `min_co_raters` users. Never contains `item` itself.
    pub fn neighbors(&self, item: Uuid, min_co_raters: usize, top_n: usize) -> Neighbors {
        let Some(users) = self.item_users.get(&item) else {
            return Vec::new();
        };
        let norm_a = self.item_norms.get(&item).copied().unwrap_or(0.0);
        if norm_a <= 0.0 {
            return Vec::new();
        }

        let mut dots: HashMap<Uuid, (f64, usize)> = HashMap::new();
        for (user, wa) in users {
            let Some(items) = self.user_items.get(user) else {
                continue;
            };
            for (other, wb) in items {
                if *other == item {
                    continue;
                }
                let entry = dots.entry(*other).or_insert((0.0, 0));
                entry.0 += wa * wb;
                entry.1 += 1;
            }
        }

        let mut neighbors: Neighbors = dots
            .into_iter()
            .filter(|(_, (_, co_raters))| *co_raters >= min_co_raters)
            .filter_map(|(other, (dot, _))| {
                let norm_b = self.item_norms.get(&other).copied().unwrap_or(0.0);
                let sim = normalized_dot(dot, norm_a, norm_b);
                (sim > 0.0).then_some((other, sim))
            })
            .collect();
        sort_neighbors(&mut neighbors);
        neighbors.truncate(top_n);
        neighbors
    }
}

/// Cosine over two sparse user-weight maps; returns (similarity, co-raters)
pub fn cosine(a: &HashMap<Uuid, f64>, b: &HashMap<Uuid, f64>) -> (f64, usize) {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut dot = 0.0;
    let mut co_raters = 0;
    for (user, w) in small {
        if let Some(other) = large.get(user) {
            dot += w * other;
            co_raters += 1;
        }
    }
    let norm_a: f64 = a.values().map(|w| w * w).sum();
    let norm_b: f64 = b.values().map(|w| w * w).sum();
    (normalized_dot(dot, norm_a, norm_b), co_raters)
}

/// `dot / sqrt(|a|^2 * |b|^2)`, 0 for zero-norm input, capped at 1.0
fn normalized_dot(dot: f64, norm_a_sq: f64, norm_b_sq: f64) -> f64 {
    let denom = (norm_a_sq * norm_b_sq).sqrt();
    if denom <= 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot / denom).min(1.0)
}

/// Highest similarity first; ties by id so rebuilds are reproducible
pub fn sort_neighbors(neighbors: &mut Neighbors) {
    neighbors.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InteractionKind;
    use chrono::Utc;

    fn event(user: Uuid, item: Uuid, kind: InteractionKind) -> InteractionEvent {
        InteractionEvent::new(user, item, kind, Utc::now())
    }

    #[test]
    fn test_repeated_signals_fold_with_max() {
        let (u, i) = (Uuid::new_v4(), Uuid::new_v4());
        let matrix = InteractionMatrix::from_events(&[
            event(u, i, InteractionKind::View),
            event(u, i, InteractionKind::View),
            event(u, i, InteractionKind::Purchase),
            event(u, i, InteractionKind::View),
        ]);

        assert_eq!(matrix.user_items(u).unwrap()[&i], 5.0);
        assert_eq!(matrix.item_users(i).unwrap()[&u], 5.0);
    }

    #[test]
    fn test_identical_interaction_sets_are_exactly_similar() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let kinds = [
            InteractionKind::Purchase,
            InteractionKind::View,
            InteractionKind::CartAdd,
            InteractionKind::Favorite,
        ];
        let mut events = Vec::new();
        for (user, kind) in users.iter().zip(kinds) {
            events.push(event(*user, a, kind));
            events.push(event(*user, b, kind));
        }
        let matrix = InteractionMatrix::from_events(&events);

        assert_eq!(matrix.similarity(a, b), (1.0, 4));
        assert_eq!(matrix.similarity(a, b).0, matrix.similarity(b, a).0);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let items: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let users: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let mut events = Vec::new();
        for (ui, user) in users.iter().enumerate() {
            for (ii, item) in items.iter().enumerate() {
                if (ui + ii) % 2 == 0 {
                    let kind = InteractionKind::ALL[(ui * 3 + ii) % 5];
                    events.push(event(*user, *item, kind));
                }
            }
        }
        let matrix = InteractionMatrix::from_events(&events);

        for a in &items {
            for b in &items {
                assert_eq!(matrix.similarity(*a, *b).0, matrix.similarity(*b, *a).0);
            }
        }
    }

    #[test]
    fn test_neighbors_exclude_self_and_respect_co_raters() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let matrix = InteractionMatrix::from_events(&[
            event(u1, a, InteractionKind::Purchase),
            event(u2, a, InteractionKind::View),
            event(u1, b, InteractionKind::Purchase),
            event(u2, b, InteractionKind::View),
            // c shares only one user with a
            event(u1, c, InteractionKind::Click),
        ]);

        let neighbors = matrix.neighbors(a, 2, 10);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, b);
        assert!(neighbors.iter().all(|(id, _)| *id != a));

        let loose = matrix.neighbors(a, 1, 10);
        assert_eq!(loose.len(), 2);
        assert!(loose[0].1 >= loose[1].1);
    }

    #[test]
    fn test_neighbors_truncated_to_top_n() {
        let target = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut events = vec![event(user, target, InteractionKind::Purchase)];
        for _ in 0..10 {
            events.push(event(user, Uuid::new_v4(), InteractionKind::View));
        }
        let matrix = InteractionMatrix::from_events(&events);

        assert_eq!(matrix.neighbors(target, 1, 3).len(), 3);
    }

    #[test]
    fn test_zero_norm_is_zero_similarity() {
        let a: HashMap<Uuid, f64> = HashMap::new();
        let mut b = HashMap::new();
        b.insert(Uuid::new_v4(), 1.0);
        assert_eq!(cosine(&a, &b), (0.0, 0));
    }
}
