use std::fmt;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::accumulator::AccumulatorSpec;
use crate::error::{Error, Result};
use crate::expression::Expression;
use crate::query::Filter;
use crate::store::{WhenMatched, WhenNotMatched};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Stage kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Match,
    Project,
    AddFields,
    Unset,
    ReplaceRoot,
    Sort,
    Limit,
    Skip,
    Count,
    Group,
    SortByCount,
    Bucket,
    Unwind,
    Lookup,
    GraphLookup,
    Facet,
    Redact,
    Sample,
    Merge,
    Out,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Match => "$match",
            StageKind::Project => "$project",
            StageKind::AddFields => "$addFields",
            StageKind::Unset => "$unset",
            StageKind::ReplaceRoot => "$replaceRoot",
            StageKind::Sort => "$sort",
            StageKind::Limit => "$limit",
            StageKind::Skip => "$skip",
            StageKind::Count => "$count",
            StageKind::Group => "$group",
            StageKind::SortByCount => "$sortByCount",
            StageKind::Bucket => "$bucket",
            StageKind::Unwind => "$unwind",
            StageKind::Lookup => "$lookup",
            StageKind::GraphLookup => "$graphLookup",
            StageKind::Facet => "$facet",
            StageKind::Redact => "$redact",
            StageKind::Sample => "$sample",
            StageKind::Merge => "$merge",
            StageKind::Out => "$out",
        }
    }

    /// Stages that must see their whole input before emitting anything.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            StageKind::Sort
                | StageKind::Count
                | StageKind::Group
                | StageKind::SortByCount
                | StageKind::Bucket
                | StageKind::Facet
                | StageKind::Sample
                | StageKind::Merge
                | StageKind::Out
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageKind::Merge | StageKind::Out)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Stage specifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Compute(Expression),
}

/// A validated `$project` body. Nested spec objects are flattened into
/// dotted paths.
#[derive(Debug, Clone)]
pub struct Projection {
    pub fields: Vec<(String, ProjectField)>,
    pub exclusion: bool,
    pub exclude_id: bool,
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub key: Expression,
    pub accumulators: Vec<(String, AccumulatorSpec)>,
}

#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub group_by: Expression,
    pub boundaries: Vec<Value>,
    pub default: Option<Value>,
    pub output: Vec<(String, AccumulatorSpec)>,
}

#[derive(Debug, Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty: bool,
}

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    /// `(localField, foreignField)` for the equality form.
    pub join: Option<(String, String)>,
    pub let_vars: Vec<(String, Expression)>,
    pub pipeline: Option<Vec<Stage>>,
    pub as_field: String,
}

#[derive(Debug, Clone)]
pub struct GraphLookupSpec {
    pub from: String,
    pub start_with: Expression,
    pub connect_from_field: String,
    pub connect_to_field: String,
    pub as_field: String,
    pub max_depth: Option<u64>,
    pub depth_field: Option<String>,
    pub restrict: Option<Filter>,
}

#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub into: String,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

/// One pipeline stage, parsed and validated from `{"$kind": body}`.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Project(Projection),
    AddFields(Vec<(String, Expression)>),
    Unset(Vec<String>),
    ReplaceRoot(Expression),
    Sort(Vec<(String, SortOrder)>),
    Limit(u64),
    Skip(u64),
    Count(String),
    Group(GroupSpec),
    SortByCount(Expression),
    Bucket(BucketSpec),
    Unwind(UnwindSpec),
    Lookup(LookupSpec),
    GraphLookup(GraphLookupSpec),
    Facet(Vec<(String, Vec<Stage>)>),
    Redact(Expression),
    Sample(u64),
    Merge(MergeSpec),
    Out(String),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Match(_) => StageKind::Match,
            Stage::Project(_) => StageKind::Project,
            Stage::AddFields(_) => StageKind::AddFields,
            Stage::Unset(_) => StageKind::Unset,
            Stage::ReplaceRoot(_) => StageKind::ReplaceRoot,
            Stage::Sort(_) => StageKind::Sort,
            Stage::Limit(_) => StageKind::Limit,
            Stage::Skip(_) => StageKind::Skip,
            Stage::Count(_) => StageKind::Count,
            Stage::Group(_) => StageKind::Group,
            Stage::SortByCount(_) => StageKind::SortByCount,
            Stage::Bucket(_) => StageKind::Bucket,
            Stage::Unwind(_) => StageKind::Unwind,
            Stage::Lookup(_) => StageKind::Lookup,
            Stage::GraphLookup(_) => StageKind::GraphLookup,
            Stage::Facet(_) => StageKind::Facet,
            Stage::Redact(_) => StageKind::Redact,
            Stage::Sample(_) => StageKind::Sample,
            Stage::Merge(_) => StageKind::Merge,
            Stage::Out(_) => StageKind::Out,
        }
    }

    pub fn parse(json: &JsonValue) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| Error::InvalidSpec("each pipeline stage must be an object".into()))?;
        let mut entries = obj.iter();
        let (name, body) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(Error::InvalidSpec(
                    "each pipeline stage must have exactly one key".into(),
                ));
            }
        };

        match name.as_str() {
            "$match" => {
                if !body.is_object() {
                    return Err(Error::InvalidSpec("$match must be an object".into()));
                }
                Ok(Stage::Match(Filter::parse(body)?))
            }
            "$project" => Ok(Stage::Project(parse_project(body)?)),
            "$addFields" | "$set" => Ok(Stage::AddFields(parse_computed_fields(name, body)?)),
            "$unset" => Ok(Stage::Unset(parse_unset(body)?)),
            "$replaceRoot" => {
                let obj = body.as_object().ok_or_else(|| {
                    Error::InvalidSpec("$replaceRoot must be an object".into())
                })?;
                let new_root = obj.get("newRoot").ok_or_else(|| {
                    Error::InvalidSpec("$replaceRoot requires 'newRoot'".into())
                })?;
                Ok(Stage::ReplaceRoot(Expression::parse(new_root)?))
            }
            "$replaceWith" => Ok(Stage::ReplaceRoot(Expression::parse(body)?)),
            "$sort" => Ok(Stage::Sort(parse_sort(body)?)),
            "$limit" => Ok(Stage::Limit(parse_count_arg("$limit", body)?)),
            "$skip" => Ok(Stage::Skip(parse_count_arg("$skip", body)?)),
            "$count" => {
                let field = body
                    .as_str()
                    .filter(|s| !s.is_empty() && !s.starts_with('$') && !s.contains('.'))
                    .ok_or_else(|| {
                        Error::InvalidSpec(
                            "$count must be a non-empty field name without '$' or '.'".into(),
                        )
                    })?;
                Ok(Stage::Count(field.to_string()))
            }
            "$group" => Ok(Stage::Group(parse_group(body)?)),
            "$sortByCount" => {
                let is_expr = body.as_str().is_some_and(|s| s.starts_with('$')) || body.is_object();
                if !is_expr {
                    return Err(Error::InvalidSpec(
                        "$sortByCount must be a field path or an expression object".into(),
                    ));
                }
                Ok(Stage::SortByCount(Expression::parse(body)?))
            }
            "$bucket" => Ok(Stage::Bucket(parse_bucket(body)?)),
            "$unwind" => Ok(Stage::Unwind(parse_unwind(body)?)),
            "$lookup" => Ok(Stage::Lookup(parse_lookup(body)?)),
            "$graphLookup" => Ok(Stage::GraphLookup(parse_graph_lookup(body)?)),
            "$facet" => Ok(Stage::Facet(parse_facet(body)?)),
            "$redact" => Ok(Stage::Redact(Expression::parse(body)?)),
            "$sample" => {
                let opts: SampleBody = body_of(StageKind::Sample, body)?;
                let size = u64::try_from(opts.size).map_err(|_| {
                    Error::InvalidSpec("$sample size must be non-negative".into())
                })?;
                Ok(Stage::Sample(size))
            }
            "$merge" => Ok(Stage::Merge(parse_merge(body)?)),
            "$out" => {
                let target: Target = body_of(StageKind::Out, body)?;
                Ok(Stage::Out(target.into_collection()?))
            }
            other => Err(Error::InvalidSpec(format!("unknown stage: {other}"))),
        }
    }
}

/// Parse a JSON array of stage documents.
pub fn parse_stages(json: &JsonValue) -> Result<Vec<Stage>> {
    let arr = json
        .as_array()
        .ok_or_else(|| Error::InvalidSpec("pipeline must be an array".into()))?;
    arr.iter().map(Stage::parse).collect()
}

/// Where a stage list appears, which decides what it may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    TopLevel,
    Facet,
    Lookup,
    /// A `$facet` anywhere below a `$lookup` pipeline.
    FacetInLookup,
}

impl Placement {
    /// Sub-pipelines of a `$lookup` run once per outer record, so they
    /// may not write.
    fn under_lookup(self) -> bool {
        matches!(self, Placement::Lookup | Placement::FacetInLookup)
    }

    fn facet_child(self) -> Placement {
        if self.under_lookup() {
            Placement::FacetInLookup
        } else {
            Placement::Facet
        }
    }
}

/// Check the structural rules of a stage list: non-empty (except a
/// `$lookup` pipeline itself), `$merge`/`$out` only last and never anywhere
/// below a `$lookup`, applied recursively to nested pipelines.
pub(crate) fn validate_stages(stages: &[Stage], placement: Placement) -> Result<()> {
    if stages.is_empty() && placement != Placement::Lookup {
        return Err(Error::InvalidSpec("pipeline must contain at least one stage".into()));
    }
    let last = stages.len().saturating_sub(1);
    for (i, stage) in stages.iter().enumerate() {
        let kind = stage.kind();
        if kind.is_terminal() {
            if placement.under_lookup() {
                return Err(Error::InvalidSpec(format!(
                    "{kind} is not allowed inside a $lookup pipeline"
                )));
            }
            if i != last {
                return Err(Error::InvalidSpec(format!(
                    "{kind} is only allowed as the last stage"
                )));
            }
        }
        match stage {
            Stage::Facet(facets) => {
                for (_, sub) in facets {
                    validate_stages(sub, placement.facet_child())?;
                }
            }
            Stage::Lookup(LookupSpec {
                pipeline: Some(sub),
                ..
            }) => validate_stages(sub, Placement::Lookup)?,
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Flat option bodies (serde)
// ---------------------------------------------------------------------------

fn body_of<T: DeserializeOwned>(kind: StageKind, body: &JsonValue) -> Result<T> {
    serde_json::from_value(body.clone()).map_err(|e| Error::InvalidSpec(format!("{kind}: {e}")))
}

/// `$out`/`$merge` destination: a collection name or `{db, coll}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Target {
    Name(String),
    Namespace {
        #[allow(dead_code)]
        db: Option<String>,
        coll: String,
    },
}

impl Target {
    fn into_collection(self) -> Result<String> {
        let name = match self {
            Target::Name(name) => name,
            Target::Namespace { coll, .. } => coll,
        };
        if name.is_empty() {
            return Err(Error::InvalidSpec("target collection name is empty".into()));
        }
        Ok(name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MergeBody {
    into: Target,
    on: Option<OneOrMany>,
    #[serde(default)]
    when_matched: WhenMatched,
    #[serde(default)]
    when_not_matched: WhenNotMatched,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UnwindBody {
    path: String,
    include_array_index: Option<String>,
    #[serde(default)]
    preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LookupBody {
    from: String,
    local_field: Option<String>,
    foreign_field: Option<String>,
    #[serde(rename = "let")]
    let_vars: Option<Map<String, JsonValue>>,
    pipeline: Option<JsonValue>,
    #[serde(rename = "as")]
    as_field: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GraphLookupBody {
    from: String,
    start_with: JsonValue,
    connect_from_field: String,
    connect_to_field: String,
    #[serde(rename = "as")]
    as_field: String,
    max_depth: Option<i64>,
    depth_field: Option<String>,
    restrict_search_with_match: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BucketBody {
    group_by: JsonValue,
    boundaries: Vec<JsonValue>,
    default: Option<JsonValue>,
    output: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SampleBody {
    size: i64,
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

fn check_field_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') {
        return Err(Error::InvalidSpec(format!(
            "{kind}: invalid field name '{name}'"
        )));
    }
    Ok(())
}

fn strip_path(kind: StageKind, path: &str) -> Result<String> {
    match path.strip_prefix('$') {
        Some(p) if !p.is_empty() && !p.starts_with('$') => Ok(p.to_string()),
        _ => Err(Error::InvalidSpec(format!(
            "{kind}: field path must start with '$': {path}"
        ))),
    }
}

fn parse_count_arg(kind: &str, body: &JsonValue) -> Result<u64> {
    let n = match Value::from_json(body) {
        Value::Int(n) => n,
        Value::Double(d) if d.fract() == 0.0 && d.is_finite() => d as i64,
        _ => {
            return Err(Error::InvalidSpec(format!("{kind} must be an integer")));
        }
    };
    u64::try_from(n).map_err(|_| Error::InvalidSpec(format!("{kind} must not be negative")))
}

fn is_include_flag(v: &JsonValue) -> Option<bool> {
    match v {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

fn flatten_projection(
    prefix: &str,
    obj: &Map<String, JsonValue>,
    out: &mut Vec<(String, ProjectField)>,
) -> Result<()> {
    for (key, spec) in obj {
        check_field_name("$project", key)?;
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match spec {
            JsonValue::Object(inner) if !inner.keys().any(|k| k.starts_with('$')) => {
                if inner.is_empty() {
                    return Err(Error::InvalidSpec(format!(
                        "$project: empty specification for '{path}'"
                    )));
                }
                flatten_projection(&path, inner, out)?;
            }
            other => {
                let field = match is_include_flag(other) {
                    Some(true) => ProjectField::Include,
                    Some(false) => ProjectField::Exclude,
                    None => ProjectField::Compute(Expression::parse(other)?),
                };
                out.push((path, field));
            }
        }
    }
    Ok(())
}

fn parse_project(body: &JsonValue) -> Result<Projection> {
    let obj = body
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::InvalidSpec("$project must be a non-empty object".into()))?;
    let mut flat = Vec::new();
    flatten_projection("", obj, &mut flat)?;

    let mut exclude_id = false;
    let mut fields = Vec::with_capacity(flat.len());
    for (path, field) in flat {
        if path == "_id" {
            match field {
                ProjectField::Exclude => {
                    exclude_id = true;
                    continue;
                }
                ProjectField::Include => continue,
                ProjectField::Compute(_) => {}
            }
        }
        fields.push((path, field));
    }

    let excludes = fields.iter().any(|(_, f)| matches!(f, ProjectField::Exclude));
    let includes = fields.iter().any(|(_, f)| !matches!(f, ProjectField::Exclude));
    if excludes && includes {
        return Err(Error::InvalidSpec(
            "$project cannot mix inclusion and exclusion".into(),
        ));
    }
    let exclusion = excludes || (fields.is_empty() && exclude_id);
    Ok(Projection {
        fields,
        exclusion,
        exclude_id,
    })
}

fn parse_computed_fields(kind: &str, body: &JsonValue) -> Result<Vec<(String, Expression)>> {
    let obj = body
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::InvalidSpec(format!("{kind} must be a non-empty object")))?;
    obj.iter()
        .map(|(k, v)| {
            check_field_name(kind, k)?;
            Ok((k.clone(), Expression::parse(v)?))
        })
        .collect()
}

fn parse_unset(body: &JsonValue) -> Result<Vec<String>> {
    let names: Vec<&JsonValue> = match body {
        JsonValue::String(_) => vec![body],
        JsonValue::Array(items) if !items.is_empty() => items.iter().collect(),
        _ => {
            return Err(Error::InvalidSpec(
                "$unset must be a field name or a non-empty array of names".into(),
            ));
        }
    };
    names
        .into_iter()
        .map(|v| {
            let name = v
                .as_str()
                .ok_or_else(|| Error::InvalidSpec("$unset field names must be strings".into()))?;
            check_field_name("$unset", name)?;
            Ok(name.to_string())
        })
        .collect()
}

fn parse_sort(body: &JsonValue) -> Result<Vec<(String, SortOrder)>> {
    let obj = body
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::InvalidSpec("$sort must be a non-empty object".into()))?;
    let mut keys = Vec::with_capacity(obj.len());
    for (field, dir) in obj {
        let order = match dir.as_f64() {
            Some(d) if d == 1.0 => SortOrder::Asc,
            Some(d) if d == -1.0 => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidSpec(format!(
                    "$sort direction for '{field}' must be 1 or -1"
                )));
            }
        };
        keys.push((field.clone(), order));
    }
    Ok(keys)
}

fn parse_accumulators(
    kind: &str,
    fields: impl IntoIterator<Item = (String, JsonValue)>,
) -> Result<Vec<(String, AccumulatorSpec)>> {
    fields
        .into_iter()
        .map(|(name, spec)| {
            check_field_name(kind, &name)?;
            if name.contains('.') {
                return Err(Error::InvalidSpec(format!(
                    "{kind}: output field '{name}' cannot contain '.'"
                )));
            }
            Ok((name, AccumulatorSpec::parse(&spec)?))
        })
        .collect()
}

fn parse_group(body: &JsonValue) -> Result<GroupSpec> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::InvalidSpec("$group must be an object".into()))?;
    let key = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidSpec("$group requires an '_id' field".into()))?;
    let accumulators = parse_accumulators(
        "$group",
        obj.iter()
            .filter(|(k, _)| k.as_str() != "_id")
            .map(|(k, v)| (k.clone(), v.clone())),
    )?;
    Ok(GroupSpec {
        key: Expression::parse(key)?,
        accumulators,
    })
}

fn parse_bucket(body: &JsonValue) -> Result<BucketSpec> {
    let opts: BucketBody = body_of(StageKind::Bucket, body)?;
    let is_expr = opts.group_by.as_str().is_some_and(|s| s.starts_with('$'))
        || opts.group_by.is_object();
    if !is_expr {
        return Err(Error::InvalidSpec(
            "$bucket groupBy must be a field path or an expression object".into(),
        ));
    }
    let boundaries: Vec<Value> = opts.boundaries.iter().map(Value::from_json).collect();
    if boundaries.len() < 2 {
        return Err(Error::InvalidSpec(
            "$bucket requires at least two boundaries".into(),
        ));
    }
    if boundaries.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::InvalidSpec(
            "$bucket boundaries must be strictly ascending".into(),
        ));
    }
    let default = opts.default.as_ref().map(Value::from_json);
    if let Some(d) = &default {
        if *d >= boundaries[0] && *d < boundaries[boundaries.len() - 1] {
            return Err(Error::InvalidSpec(
                "$bucket default must fall outside the boundaries".into(),
            ));
        }
    }
    let output = match opts.output {
        Some(map) => parse_accumulators("$bucket", map)?,
        None => vec![("count".to_string(), AccumulatorSpec::count())],
    };
    Ok(BucketSpec {
        group_by: Expression::parse(&opts.group_by)?,
        boundaries,
        default,
        output,
    })
}

fn parse_unwind(body: &JsonValue) -> Result<UnwindSpec> {
    let opts = match body {
        JsonValue::String(path) => UnwindBody {
            path: path.clone(),
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        },
        JsonValue::Object(_) => body_of(StageKind::Unwind, body)?,
        _ => {
            return Err(Error::InvalidSpec(
                "$unwind must be a string or an object".into(),
            ));
        }
    };
    if let Some(index) = &opts.include_array_index {
        check_field_name("$unwind", index)?;
    }
    Ok(UnwindSpec {
        path: strip_path(StageKind::Unwind, &opts.path)?,
        include_array_index: opts.include_array_index,
        preserve_null_and_empty: opts.preserve_null_and_empty_arrays,
    })
}

fn parse_lookup(body: &JsonValue) -> Result<LookupSpec> {
    let opts: LookupBody = body_of(StageKind::Lookup, body)?;
    check_field_name("$lookup", &opts.as_field)?;
    let join = match (opts.local_field, opts.foreign_field) {
        (Some(local), Some(foreign)) => Some((local, foreign)),
        (None, None) => None,
        _ => {
            return Err(Error::InvalidSpec(
                "$lookup requires both localField and foreignField".into(),
            ));
        }
    };
    let pipeline = match &opts.pipeline {
        Some(p) => {
            let stages = parse_stages(p)?;
            validate_stages(&stages, Placement::Lookup)?;
            Some(stages)
        }
        None => None,
    };
    if join.is_none() && pipeline.is_none() {
        return Err(Error::InvalidSpec(
            "$lookup requires localField/foreignField or a pipeline".into(),
        ));
    }
    if opts.let_vars.is_some() && pipeline.is_none() {
        return Err(Error::InvalidSpec("$lookup 'let' requires a pipeline".into()));
    }
    let let_vars = opts
        .let_vars
        .unwrap_or_default()
        .iter()
        .map(|(name, expr)| {
            let valid = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(Error::InvalidSpec(format!(
                    "$lookup: invalid variable name '{name}'"
                )));
            }
            Ok((name.clone(), Expression::parse(expr)?))
        })
        .collect::<Result<_>>()?;
    Ok(LookupSpec {
        from: opts.from,
        join,
        let_vars,
        pipeline,
        as_field: opts.as_field,
    })
}

fn parse_graph_lookup(body: &JsonValue) -> Result<GraphLookupSpec> {
    let opts: GraphLookupBody = body_of(StageKind::GraphLookup, body)?;
    check_field_name("$graphLookup", &opts.as_field)?;
    let max_depth = opts
        .max_depth
        .map(|d| {
            u64::try_from(d).map_err(|_| {
                Error::InvalidSpec("$graphLookup maxDepth must be non-negative".into())
            })
        })
        .transpose()?;
    if let Some(depth_field) = &opts.depth_field {
        check_field_name("$graphLookup", depth_field)?;
    }
    let restrict = opts
        .restrict_search_with_match
        .as_ref()
        .map(Filter::parse)
        .transpose()?;
    Ok(GraphLookupSpec {
        from: opts.from,
        start_with: Expression::parse(&opts.start_with)?,
        connect_from_field: opts.connect_from_field,
        connect_to_field: opts.connect_to_field,
        as_field: opts.as_field,
        max_depth,
        depth_field: opts.depth_field,
        restrict,
    })
}

fn parse_facet(body: &JsonValue) -> Result<Vec<(String, Vec<Stage>)>> {
    let obj = body
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::InvalidSpec("$facet must be a non-empty object".into()))?;
    obj.iter()
        .map(|(name, sub)| {
            check_field_name("$facet", name)?;
            if name.contains('.') {
                return Err(Error::InvalidSpec(format!(
                    "$facet: name '{name}' cannot contain '.'"
                )));
            }
            let stages = parse_stages(sub)?;
            validate_stages(&stages, Placement::Facet)?;
            Ok((name.clone(), stages))
        })
        .collect()
}

fn parse_merge(body: &JsonValue) -> Result<MergeSpec> {
    let opts = match body {
        JsonValue::String(name) => MergeBody {
            into: Target::Name(name.clone()),
            on: None,
            when_matched: WhenMatched::default(),
            when_not_matched: WhenNotMatched::default(),
        },
        _ => body_of(StageKind::Merge, body)?,
    };
    let on = match opts.on {
        None => vec!["_id".to_string()],
        Some(OneOrMany::One(field)) => vec![field],
        Some(OneOrMany::Many(fields)) if !fields.is_empty() => fields,
        Some(OneOrMany::Many(_)) => {
            return Err(Error::InvalidSpec("$merge 'on' must not be empty".into()));
        }
    };
    Ok(MergeSpec {
        into: opts.into.into_collection()?,
        on,
        when_matched: opts.when_matched,
        when_not_matched: opts.when_not_matched,
    })
}
