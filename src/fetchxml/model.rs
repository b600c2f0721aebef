//! The FetchXML document tree (spec §3, §4.2): a mutable model mirroring
//! the wire format, built up incrementally as the assembler lowers each
//! clause and serialized once by [`super::writer`].

/// The root of a compiled query.
#[derive(Debug, Clone, Default)]
pub struct Fetch {
    pub distinct: bool,
    pub top: Option<u64>,
    pub count: Option<u64>,
    pub page: Option<u64>,
    pub nolock: bool,
    /// Set once any attribute in the tree carries an `aggregate`.
    pub aggregate: bool,
    pub paging_cookie: Option<String>,
    pub entity: Entity,
}

impl Fetch {
    /// Recursively sorts every node's items and drops empty filters (spec
    /// §4.2, applied by the assembler on finalization).
    pub fn finalize(&mut self) {
        self.entity.finalize();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub name: String,
    pub items: Vec<Item>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn finalize(&mut self) {
        finalize_items(&mut self.items);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Inner,
    Outer,
}

impl LinkType {
    pub fn wire_name(self) -> &'static str {
        match self {
            LinkType::Inner => "inner",
            LinkType::Outer => "outer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkEntity {
    pub name: String,
    pub alias: String,
    pub from: String,
    pub to: String,
    pub link_type: LinkType,
    pub items: Vec<Item>,
}

impl LinkEntity {
    pub fn finalize(&mut self) {
        finalize_items(&mut self.items);
    }
}

/// A child of `Entity`/`LinkEntity`. Ordering within `items` follows the
/// insertion order of lowering, but finalization re-sorts by a fixed rank
/// (spec §4.2: "attributes → filter → link-entity → order") so two
/// structurally equal queries always serialize identically.
#[derive(Debug, Clone)]
pub enum Item {
    Attribute(Attribute),
    AllAttributes,
    Filter(Filter),
    LinkEntity(LinkEntity),
    Order(Order),
}

impl Item {
    fn sort_rank(&self) -> u8 {
        match self {
            Item::Attribute(_) | Item::AllAttributes => 0,
            Item::Filter(_) => 1,
            Item::LinkEntity(_) => 2,
            Item::Order(_) => 3,
        }
    }
}

fn finalize_items(items: &mut Vec<Item>) {
    for item in items.iter_mut() {
        match item {
            Item::Filter(f) => f.finalize(),
            Item::LinkEntity(l) => l.finalize(),
            _ => {}
        }
    }
    items.retain(|item| !matches!(item, Item::Filter(f) if f.is_empty()));
    items.sort_by_key(|item| item.sort_rank());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    CountColumn,
    CountColumnDistinct,
    Avg,
    Min,
    Max,
    Sum,
}

impl AggregateFunction {
    pub fn wire_name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::CountColumn | AggregateFunction::CountColumnDistinct => {
                "countcolumn"
            }
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Sum => "sum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateGrouping {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    FiscalPeriod,
    FiscalYear,
}

impl DateGrouping {
    pub fn wire_name(self) -> &'static str {
        match self {
            DateGrouping::Year => "year",
            DateGrouping::Quarter => "quarter",
            DateGrouping::Month => "month",
            DateGrouping::Week => "week",
            DateGrouping::Day => "day",
            DateGrouping::FiscalPeriod => "fiscal-period",
            DateGrouping::FiscalYear => "fiscal-year",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub alias: Option<String>,
    pub aggregate: Option<AggregateFunction>,
    pub distinct: bool,
    pub date_grouping: Option<DateGrouping>,
    pub groupby: bool,
}

impl Attribute {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            aggregate: None,
            distinct: false,
            date_grouping: None,
            groupby: false,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// `count(*)`: the primary-id attribute is used as `name` (spec §4.2).
    pub fn count_star(primary_id_attribute: impl Into<String>) -> Self {
        Self {
            aggregate: Some(AggregateFunction::Count),
            ..Self::plain(primary_id_attribute)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    /// The attribute's logical name, or its alias if it was added under one
    /// (spec §4.5 step 6: native sorts on aggregates reference the alias).
    pub attribute: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    And,
    Or,
    /// No AND/OR has been observed under this filter yet (spec §3); resolved
    /// to `And` on finalization if it never does.
    Indeterminate,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub filter_type: FilterType,
    pub items: Vec<FilterItem>,
}

impl Filter {
    pub fn indeterminate() -> Self {
        Self {
            filter_type: FilterType::Indeterminate,
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn finalize(&mut self) {
        if self.filter_type == FilterType::Indeterminate {
            self.filter_type = FilterType::And;
        }
        self.items.retain_mut(|item| {
            if let FilterItem::Filter(f) = item {
                f.finalize();
                !f.is_empty()
            } else {
                true
            }
        });
    }
}

#[derive(Debug, Clone)]
pub enum FilterItem {
    Condition(Condition),
    Filter(Filter),
}

#[derive(Debug, Clone)]
pub struct Condition {
    /// Set when the condition targets an attribute on a joined link-entity
    /// addressed by its alias, rather than the containing entity.
    pub entityname: Option<String>,
    pub attribute: String,
    pub operator: String,
    pub value: Option<String>,
    pub values: Vec<String>,
}

impl Condition {
    pub fn new(attribute: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            entityname: None,
            attribute: attribute.into(),
            operator: operator.into(),
            value: None,
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = values;
        self
    }

    pub fn in_link_entity(mut self, alias: impl Into<String>) -> Self {
        self.entityname = Some(alias.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_resolves_indeterminate_filter_to_and() {
        let mut filter = Filter::indeterminate();
        filter
            .items
            .push(FilterItem::Condition(Condition::new("name", "eq").with_value("x")));
        filter.finalize();
        assert_eq!(filter.filter_type, FilterType::And);
    }

    #[test]
    fn finalize_prunes_empty_nested_filters() {
        let mut root = Filter::indeterminate();
        root.items.push(FilterItem::Filter(Filter::indeterminate()));
        root.items
            .push(FilterItem::Condition(Condition::new("name", "eq").with_value("x")));
        root.finalize();
        assert_eq!(root.items.len(), 1);
    }

    #[test]
    fn items_sort_attributes_before_filter_before_link_before_order() {
        let mut entity = Entity::new("account");
        entity.items.push(Item::Order(Order {
            attribute: "name".into(),
            descending: false,
        }));
        entity.items.push(Item::LinkEntity(LinkEntity {
            name: "contact".into(),
            alias: "c".into(),
            from: "parentcustomerid".into(),
            to: "accountid".into(),
            link_type: LinkType::Inner,
            items: Vec::new(),
        }));
        entity.items.push(Item::Filter(Filter {
            filter_type: FilterType::And,
            items: vec![FilterItem::Condition(
                Condition::new("name", "eq").with_value("x"),
            )],
        }));
        entity.items.push(Item::Attribute(Attribute::plain("name")));
        entity.finalize();
        let ranks: Vec<u8> = entity.items.iter().map(Item::sort_rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn count_star_uses_primary_id_as_name() {
        let attr = Attribute::count_star("accountid");
        assert_eq!(attr.name, "accountid");
        assert_eq!(attr.aggregate, Some(AggregateFunction::Count));
    }
}
