//! Distances between the two runs of one variable.
//!
//! A [`Distance`] is the linear form
//!
//! ```text
//! offset + c * dq[cursor] + h * history + slack
//! ```
//!
//! where `dq[j] = qB[j] - qA[j]` is the difference of one query entry and
//! `history` sums entries the cursor has already moved past. Entry and history
//! terms may be *partial*: after a join they hold on some paths and are zero on
//! the others. The adjacency ranges always contain zero, so bounds stay sound,
//! but partial terms never cancel by coefficient arithmetic.

use std::collections::BTreeSet;
use std::fmt;

use dpcheck_ast::Adjacency;
use num_traits::{One, Signed, Zero};

use crate::sym::{Rational, Sym, rat};

/// What the adjacency relation says about one query entry.
#[derive(Clone, Debug, PartialEq)]
pub struct AdjacencyModel {
    pub adjacency: Adjacency,
    /// Length of the query array; bounds how many entries a history holds.
    pub length: Sym,
}

impl AdjacencyModel {
    pub fn new(adjacency: Adjacency, length: &str) -> Self {
        Self {
            adjacency,
            length: Sym::var(length),
        }
    }

    /// Range of `dq[j]` for a single entry.
    pub fn entry_range(&self) -> (Rational, Rational) {
        match self.adjacency {
            Adjacency::AllDiffer | Adjacency::OneDiffer => (rat(-1), rat(1)),
            Adjacency::Increasing => (rat(0), rat(1)),
            Adjacency::Decreasing => (rat(-1), rat(0)),
        }
    }

    pub fn one_differ(&self) -> bool {
        self.adjacency == Adjacency::OneDiffer
    }

    /// Bound on the number of differing entries a history can sum.
    pub fn extent_factor(&self, extent: Extent) -> Sym {
        match extent {
            Extent::Single => Sym::one(),
            Extent::Many if self.one_differ() => Sym::one(),
            Extent::Many => self.length.clone(),
        }
    }

    /// Interval of `c * dq[j]`.
    fn scaled_range(&self, c: &Rational) -> Interval {
        let (lo, hi) = self.entry_range();
        let (a, b) = (c * lo, c * hi);
        if a <= b {
            Interval::new(Sym::constant(a), Sym::constant(b))
        } else {
            Interval::new(Sym::constant(b), Sym::constant(a))
        }
    }

    fn hist_range(&self, h: &History) -> Interval {
        let r = self.scaled_range(&h.coef);
        let factor = self.extent_factor(h.extent);
        match factor.as_poly() {
            Some(p) => Interval::new(r.lo.mul_nonneg(p), r.hi.mul_nonneg(p)),
            None => r,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub lo: Sym,
    pub hi: Sym,
}

impl Interval {
    pub fn new(lo: Sym, hi: Sym) -> Self {
        Self { lo, hi }
    }

    pub fn point(s: Sym) -> Self {
        Self::new(s.clone(), s)
    }

    pub fn zero() -> Self {
        Self::point(Sym::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.lo.is_zero() && self.hi.is_zero()
    }

    pub fn add(&self, other: &Interval) -> Interval {
        Interval::new(self.lo.add(&other.lo), self.hi.add(&other.hi))
    }

    pub fn neg(&self) -> Interval {
        Interval::new(self.hi.neg(), self.lo.neg())
    }

    pub fn scale(&self, k: &Rational) -> Interval {
        if k.is_negative() {
            self.neg().scale(&-k.clone())
        } else {
            Interval::new(self.lo.scale(k), self.hi.scale(k))
        }
    }

    pub fn hull(&self, other: &Interval, positive: &BTreeSet<String>) -> Interval {
        Interval::new(
            self.lo.join_min(&other.lo).simplify(positive),
            self.hi.join_max(&other.hi).simplify(positive),
        )
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Extent {
    /// One entry the cursor has passed.
    Single,
    /// Any number of passed entries.
    Many,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct History {
    pub coef: Rational,
    pub extent: Extent,
    /// Per-record cost already attributed to these entries (`ONE_DIFFER`).
    pub weight: Sym,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryTerm {
    pub coef: Rational,
    pub partial: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Distance {
    pub offset: Sym,
    pub entry: Option<EntryTerm>,
    pub hist: Option<History>,
    pub slack: Option<Interval>,
}

/// Weights dropped while combining distances. The caller folds them into the
/// settled part of the cost ledger.
pub type Released = Vec<Sym>;

impl Distance {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn offset(s: Sym) -> Self {
        Self {
            offset: s,
            ..Self::default()
        }
    }

    /// `c * dq[cursor]`
    pub fn entry(c: Rational) -> Self {
        Self {
            entry: (!c.is_zero()).then_some(EntryTerm { coef: c, partial: false }),
            ..Self::default()
        }
    }

    pub fn within(iv: Interval) -> Self {
        Self {
            slack: (!iv.is_zero()).then_some(iv),
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.offset.is_zero()
            && self.entry.is_none()
            && self.hist.is_none()
            && self.slack.as_ref().is_none_or(Interval::is_zero)
    }

    /// Only an exact offset, no entry, history or slack part.
    pub fn is_exact(&self) -> bool {
        self.entry.is_none() && self.hist.is_none() && self.slack.as_ref().is_none_or(Interval::is_zero)
    }

    pub fn weight(&self) -> Option<&Sym> {
        self.hist.as_ref().map(|h| &h.weight)
    }

    pub fn neg(&self) -> Distance {
        self.scale(&-Rational::one())
    }

    pub fn scale(&self, k: &Rational) -> Distance {
        if k.is_zero() {
            return Distance::zero();
        }
        Distance {
            offset: self.offset.scale(k),
            entry: self.entry.as_ref().map(|e| EntryTerm {
                coef: &e.coef * k,
                partial: e.partial,
            }),
            hist: self.hist.as_ref().map(|h| History {
                coef: &h.coef * k,
                extent: h.extent,
                weight: h.weight.clone(),
            }),
            slack: self.slack.as_ref().map(|s| s.scale(k)),
        }
    }

    pub fn add(&self, other: &Distance, model: &AdjacencyModel, released: &mut Released) -> Distance {
        let mut out = Distance {
            offset: self.offset.add(&other.offset),
            entry: None,
            hist: None,
            slack: add_slack(&self.slack, &other.slack),
        };
        match (&self.entry, &other.entry) {
            (None, e) | (e, None) => out.entry = e.clone(),
            (Some(a), Some(b)) if !a.partial && !b.partial => {
                let coef = &a.coef + &b.coef;
                out.entry = (!coef.is_zero()).then_some(EntryTerm { coef, partial: false });
            }
            (Some(a), Some(b)) => {
                out.widen_slack(&model.scaled_range(&a.coef));
                out.widen_slack(&model.scaled_range(&b.coef));
            }
        }
        match (&self.hist, &other.hist) {
            (None, h) | (h, None) => out.hist = h.clone(),
            (Some(a), Some(b)) => {
                // Two histories may share entries; only their bounds survive.
                out.widen_slack(&model.hist_range(a));
                out.widen_slack(&model.hist_range(b));
                released.push(a.weight.clone());
                released.push(b.weight.clone());
            }
        }
        out
    }

    pub fn sub(&self, other: &Distance, model: &AdjacencyModel, released: &mut Released) -> Distance {
        self.add(&other.neg(), model, released)
    }

    fn widen_slack(&mut self, iv: &Interval) {
        self.slack = add_slack(&self.slack, &Some(iv.clone()));
    }

    /// Moves the current-entry term into the slack.
    pub fn blur_entry(&mut self, model: &AdjacencyModel) {
        if let Some(e) = self.entry.take() {
            self.widen_slack(&model.scaled_range(&e.coef));
        }
    }

    /// Moves the history term into the slack, releasing its weight.
    pub fn blur_hist(&mut self, model: &AdjacencyModel, released: &mut Released) {
        if let Some(h) = self.hist.take() {
            self.widen_slack(&model.hist_range(&h));
            released.push(h.weight);
        }
    }

    /// Sound interval for the whole distance.
    pub fn bounds(&self, model: &AdjacencyModel) -> Interval {
        let mut iv = Interval::point(self.offset.clone());
        if let Some(e) = &self.entry {
            iv = iv.add(&model.scaled_range(&e.coef));
        }
        if let Some(h) = &self.hist {
            iv = iv.add(&model.hist_range(h));
        }
        if let Some(s) = &self.slack {
            iv = iv.add(s);
        }
        iv
    }

    /// The cursor moved on: the current entry becomes history.
    pub fn advance(&mut self, current_weight: &Sym, model: &AdjacencyModel, positive: &BTreeSet<String>) {
        let Some(e) = self.entry.take() else {
            return;
        };
        match self.hist.take() {
            None => {
                self.hist = Some(History {
                    coef: e.coef,
                    extent: Extent::Single,
                    weight: current_weight.clone(),
                });
            }
            Some(h) if h.coef == e.coef => {
                self.hist = Some(History {
                    coef: h.coef,
                    extent: Extent::Many,
                    weight: h.weight.join_max(current_weight).simplify(positive),
                });
            }
            Some(h) => {
                self.hist = Some(h);
                self.widen_slack(&model.scaled_range(&e.coef));
            }
        }
    }

    fn simplified(mut self, positive: &BTreeSet<String>) -> Distance {
        self.offset = self.offset.simplify(positive);
        if let Some(h) = &mut self.hist {
            h.weight = h.weight.simplify(positive);
        }
        if let Some(s) = &mut self.slack {
            s.lo = s.lo.simplify(positive);
            s.hi = s.hi.simplify(positive);
            if s.is_zero() {
                self.slack = None;
            }
        }
        self
    }

    /// Least form covering both distances, keeping their structure where the
    /// two agree.
    pub fn join(
        &self,
        other: &Distance,
        model: &AdjacencyModel,
        positive: &BTreeSet<String>,
        released: &mut Released,
    ) -> Distance {
        let mut left_slack = self.slack.clone();
        let mut right_slack = other.slack.clone();
        let offset = if self.offset == other.offset {
            self.offset.clone()
        } else {
            left_slack = add_slack(&left_slack, &Some(Interval::point(self.offset.clone())));
            right_slack = add_slack(&right_slack, &Some(Interval::point(other.offset.clone())));
            Sym::zero()
        };

        let entry = match (&self.entry, &other.entry) {
            (None, None) => None,
            (Some(e), None) | (None, Some(e)) => Some(EntryTerm {
                coef: e.coef.clone(),
                partial: true,
            }),
            (Some(a), Some(b)) if a.coef == b.coef => Some(EntryTerm {
                coef: a.coef.clone(),
                partial: a.partial || b.partial,
            }),
            (Some(a), Some(b)) => {
                left_slack = add_slack(&left_slack, &Some(model.scaled_range(&a.coef)));
                right_slack = add_slack(&right_slack, &Some(model.scaled_range(&b.coef)));
                None
            }
        };

        let hist = match (&self.hist, &other.hist) {
            (None, None) => None,
            (Some(h), None) | (None, Some(h)) => Some(h.clone()),
            (Some(a), Some(b)) if a.coef == b.coef => Some(History {
                coef: a.coef.clone(),
                extent: a.extent.max(b.extent),
                weight: a.weight.join_max(&b.weight).simplify(positive),
            }),
            (Some(a), Some(b)) => {
                left_slack = add_slack(&left_slack, &Some(model.hist_range(a)));
                right_slack = add_slack(&right_slack, &Some(model.hist_range(b)));
                released.push(a.weight.clone());
                released.push(b.weight.clone());
                None
            }
        };

        let slack = match (left_slack, right_slack) {
            (None, None) => None,
            (l, r) => {
                let l = l.unwrap_or_else(Interval::zero);
                let r = r.unwrap_or_else(Interval::zero);
                Some(l.hull(&r, positive))
            }
        };

        Distance {
            offset,
            entry,
            hist,
            slack,
        }
        .simplified(positive)
    }
}

fn add_slack(a: &Option<Interval>, b: &Option<Interval>) -> Option<Interval> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(x), Some(y)) => Some(x.add(y)),
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.offset.is_zero() {
            parts.push(self.offset.to_string());
        }
        if let Some(e) = &self.entry {
            let star = if e.partial { "?" } else { "" };
            parts.push(format!("{} * dq[cursor]{star}", e.coef));
        }
        if let Some(h) = &self.hist {
            let what = match h.extent {
                Extent::Single => "dq[past]",
                Extent::Many => "sum(dq[past])",
            };
            parts.push(format!("{} * {what}", h.coef));
        }
        if let Some(s) = &self.slack {
            parts.push(s.to_string());
        }
        if parts.is_empty() {
            f.write_str("0")
        } else {
            f.write_str(&parts.join(" + "))
        }
    }
}

/// Two-run relation of one variable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    /// Same value in both runs.
    Equal,
    /// `B - A` lies within the distance.
    Diff(Distance),
    /// Nothing is known.
    Unrelated,
}

impl Relation {
    pub fn from_distance(d: Distance) -> Relation {
        if d.is_zero() { Relation::Equal } else { Relation::Diff(d) }
    }

    pub fn distance(&self) -> Option<Distance> {
        match self {
            Relation::Equal => Some(Distance::zero()),
            Relation::Diff(d) => Some(d.clone()),
            Relation::Unrelated => None,
        }
    }

    pub fn is_equal(&self) -> bool {
        matches!(self, Relation::Equal)
    }

    pub fn is_unrelated(&self) -> bool {
        matches!(self, Relation::Unrelated)
    }

    pub fn weight(&self) -> Option<&Sym> {
        match self {
            Relation::Diff(d) => d.weight(),
            _ => None,
        }
    }

    /// Applies `f` to the two distances; `Unrelated` absorbs.
    pub fn combine(
        &self,
        other: &Relation,
        f: impl FnOnce(&Distance, &Distance) -> Distance,
    ) -> Relation {
        match (self.distance(), other.distance()) {
            (Some(a), Some(b)) => Relation::from_distance(f(&a, &b)),
            _ => Relation::Unrelated,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::Equal => f.write_str("equal"),
            Relation::Diff(d) => write!(f, "diff({d})"),
            Relation::Unrelated => f.write_str("unrelated"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinMode {
    /// Keep entry, history and offset structure where both sides agree.
    Structural,
    /// Everything becomes an interval.
    Hull,
    /// Anything that still differs becomes `Unrelated`.
    Top,
}

pub fn join_relations(
    a: &Relation,
    b: &Relation,
    mode: JoinMode,
    model: &AdjacencyModel,
    positive: &BTreeSet<String>,
    released: &mut Released,
) -> Relation {
    if a == b {
        return a.clone();
    }
    let (Some(da), Some(db)) = (a.distance(), b.distance()) else {
        return Relation::Unrelated;
    };
    match mode {
        JoinMode::Structural => Relation::from_distance(da.join(&db, model, positive, released)),
        JoinMode::Hull => {
            released.extend(da.weight().cloned());
            released.extend(db.weight().cloned());
            let iv = da.bounds(model).hull(&db.bounds(model), positive);
            Relation::from_distance(Distance::within(iv))
        }
        JoinMode::Top => Relation::Unrelated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sym::ratio;

    fn model(adjacency: Adjacency) -> AdjacencyModel {
        AdjacencyModel::new(adjacency, "size")
    }

    fn positive() -> BTreeSet<String> {
        BTreeSet::from(["epsilon".to_string()])
    }

    #[test]
    fn exact_entries_cancel() {
        let m = model(Adjacency::AllDiffer);
        let mut rel = Released::new();
        let d = Distance::entry(rat(1)).add(&Distance::entry(rat(-1)), &m, &mut rel);
        assert!(d.is_zero());
    }

    #[test]
    fn partial_entries_do_not_cancel() {
        let m = model(Adjacency::AllDiffer);
        let mut rel = Released::new();
        let joined = Distance::entry(rat(1)).join(&Distance::zero(), &m, &positive(), &mut rel);
        assert!(joined.entry.as_ref().is_some_and(|e| e.partial));
        let d = joined.add(&Distance::entry(rat(-1)), &m, &mut rel);
        assert!(!d.is_zero());
        assert_eq!(d.bounds(&m), Interval::new(Sym::int(-2), Sym::int(2)));
    }

    #[test]
    fn entry_ranges_follow_adjacency() {
        let d = Distance::entry(rat(2)).add(&Distance::offset(Sym::int(-1)), &model(Adjacency::Increasing), &mut Vec::new());
        assert_eq!(d.bounds(&model(Adjacency::Increasing)), Interval::new(Sym::int(-1), Sym::int(1)));
        assert_eq!(d.bounds(&model(Adjacency::Decreasing)), Interval::new(Sym::int(-3), Sym::int(-1)));
    }

    #[test]
    fn advancing_twice_builds_a_many_history() {
        let m = model(Adjacency::AllDiffer);
        let mut d = Distance::entry(rat(1));
        d.advance(&Sym::zero(), &m, &positive());
        assert_eq!(d.hist.as_ref().map(|h| h.extent), Some(Extent::Single));
        d = d.add(&Distance::entry(rat(1)), &m, &mut Vec::new());
        d.advance(&Sym::zero(), &m, &positive());
        assert_eq!(d.hist.as_ref().map(|h| h.extent), Some(Extent::Many));
        // Under ALL_DIFFER a long history is bounded by the array length.
        assert_eq!(d.bounds(&m).hi, Sym::var("size"));
        // Under ONE_DIFFER it is bounded by a single record.
        assert_eq!(d.bounds(&model(Adjacency::OneDiffer)).hi, Sym::int(1));
    }

    #[test]
    fn differing_offsets_join_into_slack() {
        let m = model(Adjacency::AllDiffer);
        let a = Relation::Diff(Distance::offset(Sym::int(1)));
        let j = join_relations(&a, &Relation::Equal, JoinMode::Structural, &m, &positive(), &mut Vec::new());
        assert_eq!(
            j,
            Relation::Diff(Distance::within(Interval::new(Sym::int(0), Sym::int(1))))
        );
    }

    #[test]
    fn hull_and_top_modes() {
        let m = model(Adjacency::AllDiffer);
        let a = Relation::Diff(Distance::entry(ratio(1, 2)));
        let h = join_relations(&a, &Relation::Equal, JoinMode::Hull, &m, &positive(), &mut Vec::new());
        assert_eq!(
            h,
            Relation::Diff(Distance::within(Interval::new(Sym::constant(ratio(-1, 2)), Sym::constant(ratio(1, 2)))))
        );
        let t = join_relations(&a, &Relation::Equal, JoinMode::Top, &m, &positive(), &mut Vec::new());
        assert!(t.is_unrelated());
        assert!(join_relations(&a, &a, JoinMode::Top, &m, &positive(), &mut Vec::new()) == a);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn distance() -> impl Strategy<Value = Distance> {
            (-3i64..3, -2i64..3, proptest::bool::ANY).prop_map(|(off, c, partial)| {
                let mut d = Distance::offset(Sym::int(off));
                if c != 0 {
                    d.entry = Some(EntryTerm { coef: rat(c), partial });
                }
                d
            })
        }

        proptest! {
            #[test]
            fn join_covers_both_sides(a in distance(), b in distance()) {
                let m = AdjacencyModel::new(Adjacency::AllDiffer, "size");
                let j = a.join(&b, &m, &BTreeSet::new(), &mut Vec::new());
                let jb = j.bounds(&m);
                for side in [&a, &b] {
                    let sb = side.bounds(&m);
                    let lo = jb.lo.as_constant().unwrap();
                    let hi = jb.hi.as_constant().unwrap();
                    prop_assert!(lo <= sb.lo.as_constant().unwrap());
                    prop_assert!(hi >= sb.hi.as_constant().unwrap());
                }
            }

            #[test]
            fn join_is_commutative_on_bounds(a in distance(), b in distance()) {
                let m = AdjacencyModel::new(Adjacency::AllDiffer, "size");
                let ab = a.join(&b, &m, &BTreeSet::new(), &mut Vec::new());
                let ba = b.join(&a, &m, &BTreeSet::new(), &mut Vec::new());
                prop_assert_eq!(ab.bounds(&m), ba.bounds(&m));
            }
        }
    }
}
