//! Generic query evaluation
//!
//! Backends supply the primitive lookups ([`SearchPrimitives`]); boolean
//! combination, raw-query resolution, sorting and paging happen here, once,
//! for every backend. [`matches`] evaluates a query against a single loaded
//! object for backends that scan.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::Result;
use crate::object::ObjectSnapshot;
use crate::query::{Occur, Query, QueryParams};

/// Primitive lookups a backend provides to the evaluator
pub trait SearchPrimitives {
    fn all_handles(&self) -> Result<HashSet<String>>;

    fn attribute_handles(&self, name: &str, value: &str) -> Result<HashSet<String>>;

    fn element_attribute_handles(
        &self,
        element: &str,
        name: &str,
        value: &str,
    ) -> Result<HashSet<String>>;
}

/// Evaluate `query` to the set of matching handles
pub fn evaluate<P: SearchPrimitives + ?Sized>(primitives: &P, query: &Query) -> Result<HashSet<String>> {
    match query {
        Query::MatchAll => primitives.all_handles(),
        Query::Raw(text) => evaluate(primitives, &Query::resolve_raw(text)?),
        Query::Attribute { name, value } => primitives.attribute_handles(name, value),
        Query::ElementAttribute {
            element,
            name,
            value,
        } => primitives.element_attribute_handles(element, name, value),
        Query::Boolean(clauses) => {
            let mut must = Vec::new();
            let mut should = Vec::new();
            let mut must_not = Vec::new();
            for clause in clauses {
                match clause.occur {
                    Occur::Must => must.push(&clause.query),
                    Occur::Should => should.push(&clause.query),
                    Occur::MustNot => must_not.push(&clause.query),
                }
            }

            let mut result = if must.is_empty() && should.is_empty() {
                primitives.all_handles()?
            } else if must.is_empty() {
                union(primitives, &should)?
            } else {
                let mut acc = evaluate(primitives, must[0])?;
                for q in &must[1..] {
                    if acc.is_empty() {
                        break;
                    }
                    let next = evaluate(primitives, q)?;
                    acc.retain(|h| next.contains(h));
                }
                if !should.is_empty() && !acc.is_empty() {
                    let any = union(primitives, &should)?;
                    acc.retain(|h| any.contains(h));
                }
                acc
            };

            for q in must_not {
                if result.is_empty() {
                    break;
                }
                let excluded = evaluate(primitives, q)?;
                result.retain(|h| !excluded.contains(h));
            }
            Ok(result)
        }
    }
}

fn union<P: SearchPrimitives + ?Sized>(primitives: &P, queries: &[&Query]) -> Result<HashSet<String>> {
    let mut acc = HashSet::new();
    for q in queries {
        acc.extend(evaluate(primitives, q)?);
    }
    Ok(acc)
}

/// Whether a single object matches `query`
pub fn matches(query: &Query, object: &ObjectSnapshot) -> Result<bool> {
    Ok(match query {
        Query::MatchAll => true,
        Query::Raw(text) => matches(&Query::resolve_raw(text)?, object)?,
        Query::Attribute { name, value } => object.attributes.get(name) == Some(value),
        Query::ElementAttribute {
            element,
            name,
            value,
        } => object
            .elements
            .get(element)
            .is_some_and(|el| el.attributes.get(name) == Some(value)),
        Query::Boolean(clauses) => {
            let mut any_should = false;
            let mut should_matched = false;
            for clause in clauses {
                let hit = matches(&clause.query, object)?;
                match clause.occur {
                    Occur::Must if !hit => return Ok(false),
                    Occur::MustNot if hit => return Ok(false),
                    Occur::Should => {
                        any_should = true;
                        should_matched |= hit;
                    }
                    _ => {}
                }
            }
            !any_should || should_matched
        }
    })
}

fn is_handle_field(name: &str) -> bool {
    name == "id" || name == "objectid"
}

/// Order and page a result set.
///
/// `lookup` returns the attribute a sort field names. Without sort fields
/// results are ordered by handle so pages are stable.
pub fn sort_and_page<F>(handles: HashSet<String>, params: &QueryParams, lookup: F) -> Result<Vec<String>>
where
    F: Fn(&str, &str) -> Result<Option<String>>,
{
    let mut keyed = Vec::with_capacity(handles.len());
    for handle in handles {
        let mut keys = Vec::with_capacity(params.sort_fields.len());
        for field in &params.sort_fields {
            let key = if is_handle_field(&field.name) {
                Some(handle.clone())
            } else {
                lookup(&handle, &field.name)?
            };
            keys.push(key);
        }
        keyed.push((keys, handle));
    }

    keyed.sort_by(|(ka, ha), (kb, hb)| {
        for (i, field) in params.sort_fields.iter().enumerate() {
            // Missing values sort last in either direction
            let ord = match (&ka[i], &kb[i]) {
                (Some(a), Some(b)) if field.reverse => b.cmp(a),
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        ha.cmp(hb)
    });

    let iter = keyed.into_iter().map(|(_, h)| h);
    Ok(if params.page_size == 0 {
        iter.collect()
    } else {
        iter.skip(params.page_offset.saturating_mul(params.page_size))
            .take(params.page_size)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ElementSnapshot;
    use crate::query::{BooleanClause, SortField};
    use std::collections::HashMap;

    /// In-memory corpus used as primitives and as a brute-force oracle
    struct Corpus(HashMap<String, ObjectSnapshot>);

    impl Corpus {
        fn new(objects: &[(&str, &[(&str, &str)])]) -> Self {
            let mut map = HashMap::new();
            for (handle, atts) in objects {
                let mut snap = ObjectSnapshot::new(*handle);
                for (k, v) in *atts {
                    snap.attributes.insert(k.to_string(), v.to_string());
                }
                map.insert(handle.to_string(), snap);
            }
            Corpus(map)
        }
    }

    impl SearchPrimitives for Corpus {
        fn all_handles(&self) -> Result<HashSet<String>> {
            Ok(self.0.keys().cloned().collect())
        }

        fn attribute_handles(&self, name: &str, value: &str) -> Result<HashSet<String>> {
            Ok(self
                .0
                .values()
                .filter(|o| o.attributes.get(name).map(String::as_str) == Some(value))
                .map(|o| o.handle.clone())
                .collect())
        }

        fn element_attribute_handles(&self, element: &str, name: &str, value: &str) -> Result<HashSet<String>> {
            let q = Query::element_attribute(element, name, value);
            let mut out = HashSet::new();
            for o in self.0.values() {
                if matches(&q, o)? {
                    out.insert(o.handle.clone());
                }
            }
            Ok(out)
        }
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn corpus() -> Corpus {
        Corpus::new(&[
            ("a", &[("type", "doc"), ("lang", "en")]),
            ("b", &[("type", "doc"), ("lang", "fr")]),
            ("c", &[("type", "img"), ("lang", "en")]),
            ("d", &[]),
        ])
    }

    fn clause(name: &str, value: &str, occur: Occur) -> BooleanClause {
        BooleanClause::new(Query::attribute(name, value), occur)
    }

    #[test]
    fn test_all_must() {
        let q = Query::Boolean(vec![clause("type", "doc", Occur::Must), clause("lang", "en", Occur::Must)]);
        assert_eq!(evaluate(&corpus(), &q).unwrap(), set(&["a"]));
    }

    #[test]
    fn test_all_should() {
        let q = Query::Boolean(vec![clause("type", "img", Occur::Should), clause("lang", "fr", Occur::Should)]);
        assert_eq!(evaluate(&corpus(), &q).unwrap(), set(&["b", "c"]));
    }

    #[test]
    fn test_all_must_not() {
        let q = Query::Boolean(vec![clause("type", "doc", Occur::MustNot)]);
        assert_eq!(evaluate(&corpus(), &q).unwrap(), set(&["c", "d"]));
    }

    #[test]
    fn test_mixed() {
        let q = Query::Boolean(vec![
            clause("type", "doc", Occur::Must),
            clause("lang", "en", Occur::Should),
            clause("lang", "de", Occur::Should),
            clause("lang", "fr", Occur::MustNot),
        ]);
        assert_eq!(evaluate(&corpus(), &q).unwrap(), set(&["a"]));
        let c = corpus();
        for o in c.0.values() {
            assert_eq!(matches(&q, o).unwrap(), o.handle == "a");
        }
    }

    #[test]
    fn test_empty_boolean_matches_everything() {
        assert_eq!(evaluate(&corpus(), &Query::Boolean(vec![])).unwrap(), set(&["a", "b", "c", "d"]));
    }

    #[test]
    fn test_raw_query() {
        let q = Query::raw("att.name = 'lang' AND att.value = 'fr'");
        assert_eq!(evaluate(&corpus(), &q).unwrap(), set(&["b"]));
        assert!(evaluate(&corpus(), &Query::raw("lang=fr")).is_err());
    }

    #[test]
    fn test_element_attribute_match() {
        let mut snap = ObjectSnapshot::new("x");
        let mut el = ElementSnapshot::default();
        el.attributes.insert("mimetype".into(), "text/plain".into());
        snap.elements.insert("content".into(), el);
        assert!(matches(&Query::element_attribute("content", "mimetype", "text/plain"), &snap).unwrap());
        assert!(!matches(&Query::element_attribute("other", "mimetype", "text/plain"), &snap).unwrap());
    }

    #[test]
    fn test_sort_and_page() {
        let c = corpus();
        let lookup = |h: &str, n: &str| -> Result<Option<String>> {
            Ok(c.0.get(h).and_then(|o| o.attributes.get(n).cloned()))
        };
        let all = set(&["a", "b", "c", "d"]);

        let by_handle = sort_and_page(all.clone(), &QueryParams::default(), lookup).unwrap();
        assert_eq!(by_handle, vec!["a", "b", "c", "d"]);

        let params = QueryParams::default().sorted_by(SortField::descending("lang"));
        let sorted = sort_and_page(all.clone(), &params, lookup).unwrap();
        assert_eq!(sorted, vec!["b", "a", "c", "d"]);

        let page = sort_and_page(all, &QueryParams::page(1, 3), lookup).unwrap();
        assert_eq!(page, vec!["d"]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_clause() -> impl Strategy<Value = BooleanClause> {
            (0..3usize, 0..3usize, 0..3usize).prop_map(|(n, v, o)| {
                let occur = [Occur::Must, Occur::Should, Occur::MustNot][o];
                BooleanClause::new(Query::attribute(format!("k{}", n), format!("v{}", v)), occur)
            })
        }

        fn arb_corpus() -> impl Strategy<Value = Vec<Vec<Option<usize>>>> {
            prop::collection::vec(prop::collection::vec(prop::option::of(0..3usize), 3), 0..12)
        }

        proptest! {
            #[test]
            fn boolean_evaluation_agrees_with_per_object_semantics(
                objects in arb_corpus(),
                clauses in prop::collection::vec(arb_clause(), 0..5),
            ) {
                let mut map = HashMap::new();
                for (i, values) in objects.iter().enumerate() {
                    let mut snap = ObjectSnapshot::new(format!("h{}", i));
                    for (k, v) in values.iter().enumerate() {
                        if let Some(v) = v {
                            snap.attributes.insert(format!("k{}", k), format!("v{}", v));
                        }
                    }
                    map.insert(snap.handle.clone(), snap);
                }
                let corpus = Corpus(map);
                let q = Query::Boolean(clauses);
                let evaluated = evaluate(&corpus, &q).unwrap();
                for o in corpus.0.values() {
                    prop_assert_eq!(evaluated.contains(&o.handle), matches(&q, o).unwrap());
                }
            }
        }
    }
}
