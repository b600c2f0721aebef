//! Serializes a [`super::model::Fetch`] tree to FetchXML text.
//!
//! Built on `quick-xml`'s event writer instead of string concatenation
//! (unlike the teacher's hand-rolled FQL-to-XML generator) so attribute
//! values get correct escaping for free, and pretty-printed with two-space
//! indentation so the round-trip property (spec §8 Property 1) has a
//! deterministic target to re-parse against.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;

use super::model::{
    Attribute, Condition, Entity, Fetch, Filter, FilterItem, FilterType, Item, LinkEntity, Order,
};

/// Renders `fetch` as pretty-printed FetchXML.
pub fn write_fetch(fetch: &Fetch) -> String {
    let mut buf = Vec::new();
    {
        let mut writer = Writer::new_with_indent(&mut buf, b' ', 2);
        write_fetch_inner(&mut writer, fetch).expect("writing to an in-memory buffer cannot fail");
    }
    String::from_utf8(buf).expect("quick-xml only emits valid UTF-8")
}

fn write_fetch_inner<W: std::io::Write>(
    writer: &mut Writer<W>,
    fetch: &Fetch,
) -> quick_xml::Result<()> {
    let mut start = BytesStart::new("fetch");
    if fetch.distinct {
        start.push_attribute(("distinct", "true"));
    }
    if let Some(top) = fetch.top {
        start.push_attribute(("top", top.to_string().as_str()));
    }
    if let Some(count) = fetch.count {
        start.push_attribute(("count", count.to_string().as_str()));
    }
    if let Some(page) = fetch.page {
        start.push_attribute(("page", page.to_string().as_str()));
    }
    if fetch.nolock {
        start.push_attribute(("no-lock", "true"));
    }
    if fetch.aggregate {
        start.push_attribute(("aggregate", "true"));
    }
    if let Some(cookie) = &fetch.paging_cookie {
        start.push_attribute(("paging-cookie", cookie.as_str()));
    }
    writer.write_event(Event::Start(start))?;
    write_entity(writer, &fetch.entity)?;
    writer.write_event(Event::End(BytesEnd::new("fetch")))?;
    Ok(())
}

fn write_entity<W: std::io::Write>(writer: &mut Writer<W>, entity: &Entity) -> quick_xml::Result<()> {
    let mut start = BytesStart::new("entity");
    start.push_attribute(("name", entity.name.as_str()));
    writer.write_event(Event::Start(start))?;
    write_items(writer, &entity.items)?;
    writer.write_event(Event::End(BytesEnd::new("entity")))?;
    Ok(())
}

fn write_items<W: std::io::Write>(writer: &mut Writer<W>, items: &[Item]) -> quick_xml::Result<()> {
    for item in items {
        match item {
            Item::Attribute(attr) => write_attribute(writer, attr)?,
            Item::AllAttributes => {
                writer.write_event(Event::Empty(BytesStart::new("all-attributes")))?;
            }
            Item::Filter(filter) => write_filter(writer, filter)?,
            Item::LinkEntity(link) => write_link_entity(writer, link)?,
            Item::Order(order) => write_order(writer, order)?,
        }
    }
    Ok(())
}

fn write_attribute<W: std::io::Write>(
    writer: &mut Writer<W>,
    attr: &Attribute,
) -> quick_xml::Result<()> {
    let mut start = BytesStart::new("attribute");
    start.push_attribute(("name", attr.name.as_str()));
    if let Some(alias) = &attr.alias {
        start.push_attribute(("alias", alias.as_str()));
    }
    if let Some(agg) = attr.aggregate {
        start.push_attribute(("aggregate", agg.wire_name()));
        start.push_attribute(("aggregatespecified", "true"));
    }
    if attr.distinct {
        start.push_attribute(("distinct", "true"));
        start.push_attribute(("distinctspecified", "true"));
    }
    if let Some(dg) = attr.date_grouping {
        start.push_attribute(("dategrouping", dg.wire_name()));
        start.push_attribute(("dategroupingspecified", "true"));
    }
    if attr.groupby {
        start.push_attribute(("groupby", "true"));
        start.push_attribute(("groupbyspecified", "true"));
    }
    writer.write_event(Event::Empty(start))?;
    Ok(())
}

fn write_order<W: std::io::Write>(writer: &mut Writer<W>, order: &Order) -> quick_xml::Result<()> {
    let mut start = BytesStart::new("order");
    start.push_attribute(("attribute", order.attribute.as_str()));
    if order.descending {
        start.push_attribute(("descending", "true"));
    }
    writer.write_event(Event::Empty(start))?;
    Ok(())
}

fn write_filter<W: std::io::Write>(
    writer: &mut Writer<W>,
    filter: &Filter,
) -> quick_xml::Result<()> {
    let type_name = match filter.filter_type {
        FilterType::And => "and",
        FilterType::Or => "or",
        FilterType::Indeterminate => "and",
    };
    let mut start = BytesStart::new("filter");
    start.push_attribute(("type", type_name));
    writer.write_event(Event::Start(start))?;
    for item in &filter.items {
        match item {
            FilterItem::Condition(cond) => write_condition(writer, cond)?,
            FilterItem::Filter(nested) => write_filter(writer, nested)?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new("filter")))?;
    Ok(())
}

fn write_condition<W: std::io::Write>(
    writer: &mut Writer<W>,
    cond: &Condition,
) -> quick_xml::Result<()> {
    let mut start = BytesStart::new("condition");
    if let Some(entityname) = &cond.entityname {
        start.push_attribute(("entityname", entityname.as_str()));
    }
    start.push_attribute(("attribute", cond.attribute.as_str()));
    start.push_attribute(("operator", cond.operator.as_str()));
    if let Some(value) = &cond.value {
        start.push_attribute(("value", value.as_str()));
    }
    if cond.values.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    for value in &cond.values {
        writer.write_event(Event::Start(BytesStart::new("value")))?;
        writer.write_event(Event::Text(BytesText::new(value)))?;
        writer.write_event(Event::End(BytesEnd::new("value")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("condition")))?;
    Ok(())
}

fn write_link_entity<W: std::io::Write>(
    writer: &mut Writer<W>,
    link: &LinkEntity,
) -> quick_xml::Result<()> {
    let mut start = BytesStart::new("link-entity");
    start.push_attribute(("name", link.name.as_str()));
    start.push_attribute(("alias", link.alias.as_str()));
    start.push_attribute(("from", link.from.as_str()));
    start.push_attribute(("to", link.to.as_str()));
    start.push_attribute(("link-type", link.link_type.wire_name()));
    writer.write_event(Event::Start(start))?;
    write_items(writer, &link.items)?;
    writer.write_event(Event::End(BytesEnd::new("link-entity")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchxml::model::*;

    #[test]
    fn writes_simple_select() {
        let mut entity = Entity::new("account");
        entity.items.push(Item::Attribute(Attribute::plain("accountid")));
        entity.items.push(Item::Attribute(Attribute::plain("name")));
        let fetch = Fetch {
            entity,
            ..Fetch::default()
        };
        let xml = write_fetch(&fetch);
        assert!(xml.contains(r#"<entity name="account">"#));
        assert!(xml.contains(r#"<attribute name="accountid" />"#));
        assert!(xml.contains(r#"<attribute name="name" />"#));
    }

    #[test]
    fn aggregate_attribute_carries_specified_companion() {
        let mut entity = Entity::new("account");
        entity
            .items
            .push(Item::Attribute(Attribute::count_star("accountid").with_alias("cnt")));
        let fetch = Fetch {
            aggregate: true,
            entity,
            ..Fetch::default()
        };
        let xml = write_fetch(&fetch);
        assert!(xml.contains(r#"aggregate="count""#));
        assert!(xml.contains(r#"aggregatespecified="true""#));
    }

    #[test]
    fn filter_with_condition_round_trips_through_text() {
        let mut root = Filter::indeterminate();
        root.items.push(FilterItem::Condition(
            Condition::new("name", "eq").with_value("test"),
        ));
        root.filter_type = FilterType::And;
        let mut entity = Entity::new("account");
        entity.items.push(Item::Filter(root));
        let fetch = Fetch {
            entity,
            ..Fetch::default()
        };
        let xml = write_fetch(&fetch);
        assert!(xml.contains(r#"<filter type="and">"#));
        assert!(xml.contains(r#"value="test""#));
    }
}
