use std::cmp::Ordering;

use super::Signature;

/// Total order over matching signatures: more criteria first, then name.
pub fn precedence(a: &Signature, b: &Signature) -> Ordering {
    b.specificity()
        .cmp(&a.specificity())
        .then_with(|| a.name.cmp(&b.name))
}

/// Pick the winning signature among those that matched.
pub fn best<'a>(matched: impl IntoIterator<Item = &'a Signature>) -> Option<&'a Signature> {
    matched.into_iter().min_by(|a, b| precedence(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::rules::CriterionValue;
    use std::collections::BTreeMap;

    fn make_sig(name: &str, keys: &[&str]) -> Signature {
        let criteria: BTreeMap<String, CriterionValue> = keys
            .iter()
            .map(|k| (k.to_string(), CriterionValue::Integer(1)))
            .collect();
        Signature::new(name, &criteria).unwrap()
    }

    #[test]
    fn empty_has_no_winner() {
        assert!(best(std::iter::empty()).is_none());
    }

    #[test]
    fn most_specific_wins() {
        let broad = make_sig("a_broad", &["min_flows"]);
        let narrow = make_sig("z_narrow", &["min_flows", "port", "min_bytes"]);
        assert_eq!(best([&broad, &narrow]).unwrap().name, "z_narrow");
        assert_eq!(best([&narrow, &broad]).unwrap().name, "z_narrow");
    }

    #[test]
    fn equal_specificity_breaks_by_name() {
        let x = make_sig("beta", &["min_flows", "port"]);
        let y = make_sig("alpha", &["min_bytes", "port"]);
        for _ in 0..3 {
            assert_eq!(best([&x, &y]).unwrap().name, "alpha");
            assert_eq!(best([&y, &x]).unwrap().name, "alpha");
        }
    }

    #[test]
    fn precedence_is_total() {
        let a = make_sig("a", &["port"]);
        let b = make_sig("b", &["port"]);
        assert_eq!(precedence(&a, &b), Ordering::Less);
        assert_eq!(precedence(&b, &a), Ordering::Greater);
        assert_eq!(precedence(&a, &a), Ordering::Equal);
    }
}
