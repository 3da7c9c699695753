//! 远程文档与查询模型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// 远程存储中的单个文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// 不透明的文档 ID
    pub id: String,
    /// 所属集合
    pub collection: String,
    /// 文档内容
    pub data: Value,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            data,
        }
    }

    /// 按键路径读取字段，支持嵌套键如 "meta.path"
    pub fn field(&self, path: &str) -> Option<&Value> {
        get_nested(&self.data, path)
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// 远程推送的单条文档变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

impl DocumentChange {
    pub fn new(kind: ChangeKind, document: Document) -> Self {
        Self { kind, document }
    }
}

/// 过滤操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

/// where 条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn matches(&self, document: &Document) -> bool {
        let Some(actual) = document.field(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .map(|candidates| candidates.contains(actual))
                .unwrap_or(false),
        }
    }
}

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// 查询描述：`orderBy` + `where` (+ 可选 limit)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default, rename = "where")]
    pub filters: Vec<FieldFilter>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// 文档是否满足所有 where 条件
    pub fn matches(&self, document: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(document))
    }

    /// 对结果集排序并截断
    ///
    /// 未指定排序字段时按文档 ID 排序；缺失排序字段的文档排在最后。
    pub fn arrange(&self, documents: &mut Vec<Document>) {
        match &self.order_by {
            Some(order) => documents.sort_by(|a, b| {
                let ordering = match (a.field(&order.field), b.field(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => return Ordering::Less,
                    (None, Some(_)) => return Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ordering = match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                ordering.then_with(|| a.id.cmp(&b.id))
            }),
            None => documents.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
    }
}

/// 比较两个 JSON 值（仅同类标量可比较）
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// 按 `.` 分隔的键路径读取嵌套值
pub fn get_nested<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, data: Value) -> Document {
        Document::new("notes", id, data)
    }

    #[test]
    fn test_nested_field_lookup() {
        let d = doc("a", json!({"meta": {"path": "inbox/today"}}));
        assert_eq!(d.field("meta.path"), Some(&json!("inbox/today")));
        assert_eq!(d.field("meta.missing"), None);
    }

    #[test]
    fn test_filters() {
        let d = doc("a", json!({"rank": 3, "tag": "work"}));
        let q = QuerySpec::new()
            .filter("rank", FilterOp::Ge, json!(2))
            .filter("tag", FilterOp::In, json!(["work", "home"]));
        assert!(q.matches(&d));

        let q = QuerySpec::new().filter("rank", FilterOp::Lt, json!(3));
        assert!(!q.matches(&d));

        let q = QuerySpec::new().filter("absent", FilterOp::Ne, json!(1));
        assert!(!q.matches(&d));
    }

    #[test]
    fn test_arrange_orders_and_limits() {
        let mut docs = vec![
            doc("c", json!({"rank": 1})),
            doc("a", json!({"rank": 3})),
            doc("b", json!({})),
            doc("d", json!({"rank": 2})),
        ];
        QuerySpec::new()
            .order_by("rank", Direction::Desc)
            .limit(3)
            .arrange(&mut docs);
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "c"]);
    }

    #[test]
    fn test_arrange_defaults_to_id_order() {
        let mut docs = vec![doc("b", json!({})), doc("a", json!({}))];
        QuerySpec::new().arrange(&mut docs);
        assert_eq!(docs[0].id, "a");
    }

    #[test]
    fn test_query_spec_where_is_renamed() {
        let q: QuerySpec = serde_json::from_value(json!({
            "where": [{"field": "tag", "op": "eq", "value": "x"}]
        }))
        .unwrap();
        assert_eq!(q.filters.len(), 1);
        assert_eq!(q.filters[0].op, FilterOp::Eq);
    }
}
