//! Structured record queries and their compiled backend filter form.
//!
//! A [`Query`] is a tree of typed field constraints combined with `$and`,
//! `$or` and `$not`. [`compile`] turns it into a [`TagFilter`], the
//! backend's WQL-like filter over raw string tags, running every leaf
//! through the tag codec.
//!
//! An absent combinator and an empty one are different things: a missing
//! `$or` means "no disjunction", while `$or: []` matches nothing. Both the
//! query and the compiled filter keep combinators as `Option` so that
//! difference survives compilation and serialization.

use serde::{Deserialize, Serialize};

use crate::codec::{self, RawTags, TagValue, Tags};

/// A structured query over typed record tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Leaf constraints, all of which must hold.
    #[serde(flatten)]
    pub fields: Tags,
    #[serde(rename = "$and", default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<Query>>,
    #[serde(rename = "$or", default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<Query>>,
    #[serde(rename = "$not", default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Query>>,
}

impl Query {
    /// A query without constraints; matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a leaf constraint.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn and(mut self, queries: Vec<Query>) -> Self {
        self.and = Some(queries);
        self
    }

    pub fn or(mut self, queries: Vec<Query>) -> Self {
        self.or = Some(queries);
        self
    }

    pub fn not(mut self, query: Query) -> Self {
        self.not = Some(Box::new(query));
        self
    }
}

/// Backend-native tag filter produced by [`compile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    /// Equality constraints on raw tags.
    #[serde(flatten)]
    pub fields: RawTags,
    #[serde(rename = "$and", default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<TagFilter>>,
    #[serde(rename = "$or", default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<TagFilter>>,
    #[serde(rename = "$not", default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<TagFilter>>,
}

impl TagFilter {
    /// `true` when the filter places no constraint at all.
    pub fn is_unconstrained(&self) -> bool {
        self.fields.is_empty() && self.and.is_none() && self.or.is_none() && self.not.is_none()
    }

    /// Evaluate the filter against a record's raw tags.
    ///
    /// Leaf fields and `$and` must all hold, `$or` needs at least one match
    /// (so an empty `$or` never matches) and `$not` must not match.
    pub fn matches(&self, tags: &RawTags) -> bool {
        let fields_hold = self
            .fields
            .iter()
            .all(|(key, expected)| tags.get(key) == Some(expected));

        fields_hold
            && self
                .and
                .as_ref()
                .is_none_or(|all| all.iter().all(|f| f.matches(tags)))
            && self
                .or
                .as_ref()
                .is_none_or(|any| any.iter().any(|f| f.matches(tags)))
            && self.not.as_ref().is_none_or(|not| !not.matches(tags))
    }
}

/// Compile a structured query into a backend tag filter.
pub fn compile(query: &Query) -> TagFilter {
    let mut fields = RawTags::new();
    for (key, value) in &query.fields {
        codec::encode_field(key, value, &mut fields);
    }

    TagFilter {
        fields,
        and: query.and.as_ref().map(|qs| qs.iter().map(compile).collect()),
        or: query.or.as_ref().map(|qs| qs.iter().map(compile).collect()),
        not: query.not.as_ref().map(|q| Box::new(compile(q))),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(pairs: &[(&str, &str)]) -> RawTags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn omitted_combinators_stay_omitted() {
        let filter = compile(&Query::all().field("myTag", "foobar"));

        assert!(filter.and.is_none());
        assert!(filter.or.is_none());
        assert!(filter.not.is_none());
        assert_eq!(serde_json::to_value(&filter).unwrap(), json!({ "myTag": "foobar" }));
    }

    #[test]
    fn and_or_branches_encode_leaves() {
        let query = Query::all()
            .and(vec![Query::all().field("a", true)])
            .or(vec![Query::all().field("b", vec!["x", "y"])]);

        let filter = compile(&query);
        assert!(filter.not.is_none());
        assert_eq!(filter.and.as_ref().unwrap()[0].fields, raw(&[("a", "1")]));
        assert_eq!(
            filter.or.as_ref().unwrap()[0].fields,
            raw(&[("b:x", "1"), ("b:y", "1")])
        );
    }

    #[test]
    fn advanced_query_compiles_to_expected_shape() {
        let query = Query::all()
            .and(vec![
                Query::all().or(vec![
                    Query::all().field("myTag", true),
                    Query::all().field("myTag", false),
                ]),
                Query::all().and(vec![
                    Query::all().field("theNumber", "0"),
                    Query::all().field("theNumber", "1"),
                ]),
            ])
            .or(vec![Query::all().field("aValue", vec!["foo", "bar"])])
            .not(Query::all().field("myTag", "notfoobar"));

        assert_eq!(
            serde_json::to_value(compile(&query)).unwrap(),
            json!({
                "$and": [
                    { "$or": [{ "myTag": "1" }, { "myTag": "0" }] },
                    { "$and": [{ "theNumber": "n__0" }, { "theNumber": "n__1" }] }
                ],
                "$or": [{ "aValue:foo": "1", "aValue:bar": "1" }],
                "$not": { "myTag": "notfoobar" }
            })
        );
    }

    #[test]
    fn empty_list_is_preserved_as_empty() {
        let filter = compile(&Query::all().or(vec![]));
        assert_eq!(filter.or, Some(vec![]));
        assert!(!filter.matches(&raw(&[("x", "1")])));
    }

    #[test]
    fn null_leaf_places_no_constraint() {
        let filter = compile(&Query::all().field("myTag", TagValue::Null));
        assert!(filter.is_unconstrained());
    }

    #[test]
    fn query_deserializes_from_wql_json() {
        let query: Query = serde_json::from_value(json!({
            "myTag": "foo",
            "$not": { "other": true }
        }))
        .unwrap();

        assert_eq!(query.fields["myTag"], TagValue::from("foo"));
        assert!(query.and.is_none());
        assert_eq!(query.not.unwrap().fields["other"], TagValue::Bool(true));
    }

    #[test]
    fn filter_evaluation() {
        let tags = raw(&[("myTag", "foo"), ("kind:a", "1"), ("kind:b", "1")]);

        assert!(TagFilter::default().matches(&tags));
        assert!(compile(&Query::all().field("myTag", "foo")).matches(&tags));
        assert!(!compile(&Query::all().field("myTag", "bar")).matches(&tags));
        assert!(compile(&Query::all().field("kind", vec!["a"])).matches(&tags));
        assert!(!compile(&Query::all().field("kind", vec!["a", "c"])).matches(&tags));

        let either = Query::all().or(vec![
            Query::all().field("myTag", "bar"),
            Query::all().field("kind", vec!["b"]),
        ]);
        assert!(compile(&either).matches(&tags));

        let negated = Query::all().not(Query::all().field("myTag", "foo"));
        assert!(!compile(&negated).matches(&tags));
    }
}
