use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

use crate::models::{NewExtractionRule, NewObjectType};
use crate::schema::{extraction_rules, object_types};

use super::PROVENANCE_SEED;

const DEFAULT_TYPES: &[(&str, &str, &str)] = &[
    ("purchase_order", "Purchase Order", "#4C7FB2"),
    ("order", "Order", "#5B9E6F"),
    ("invoice", "Invoice", "#B2694C"),
    ("shipment", "Shipment", "#8A6FB2"),
    ("product", "Product", "#B29A4C"),
    ("customer", "Customer", "#4CB2A3"),
    ("supplier", "Supplier", "#B24C86"),
    ("task", "Task", "#7A7A7A"),
    ("ledger_entry", "Ledger Entry", "#4C5FB2"),
];

struct SeedRule {
    name: &'static str,
    object_type: &'static str,
    source_fields: &'static str,
    pattern: &'static str,
    name_template: &'static str,
    data_mapping: &'static str,
    priority: i32,
}

const DEFAULT_RULES: &[SeedRule] = &[
    SeedRule {
        name: "purchase order number",
        object_type: "purchase_order",
        source_fields: r#"["title","url","ocr_text"]"#,
        pattern: r"(?:Purchase Order|PO)\s*#?\s*(?P<n>PO-\d{4}-\d{6})",
        name_template: "{n}",
        data_mapping: r#"{"n":"po_number"}"#,
        priority: 100,
    },
    SeedRule {
        name: "invoice number",
        object_type: "invoice",
        source_fields: r#"["title","ocr_text"]"#,
        pattern: r"(?:Invoice|INV)\s*#?\s*(?P<n>INV-\d{4,10})",
        name_template: "{n}",
        data_mapping: r#"{"n":"invoice_number"}"#,
        priority: 90,
    },
    SeedRule {
        name: "order id in url",
        object_type: "order",
        source_fields: r#"["url"]"#,
        pattern: r"/orders?/(?P<n>\d{4,12})",
        name_template: "order-{n}",
        data_mapping: r#"{"n":"order_id"}"#,
        priority: 50,
    },
];

/// Inserts the default ontology on first start. Existing rows are left
/// untouched so user edits survive restarts.
pub fn seed_defaults(conn: &mut SqliteConnection) -> QueryResult<()> {
    let now = Utc::now().naive_utc();

    for (name, display_name, color) in DEFAULT_TYPES {
        diesel::insert_into(object_types::table)
            .values(NewObjectType {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                display_name: display_name.to_string(),
                data_schema: None,
                icon: None,
                color: Some(color.to_string()),
                created_at: now,
                updated_at: now,
            })
            .on_conflict(object_types::name)
            .do_nothing()
            .execute(conn)?;
    }

    for rule in DEFAULT_RULES {
        let exists: i64 = extraction_rules::table
            .filter(extraction_rules::name.eq(rule.name))
            .filter(extraction_rules::provenance.eq(PROVENANCE_SEED))
            .count()
            .get_result(conn)?;
        if exists > 0 {
            continue;
        }
        diesel::insert_into(extraction_rules::table)
            .values(NewExtractionRule {
                id: Uuid::new_v4().to_string(),
                name: rule.name.to_string(),
                object_type: rule.object_type.to_string(),
                source_fields: rule.source_fields.to_string(),
                pattern: rule.pattern.to_string(),
                name_template: rule.name_template.to_string(),
                data_mapping: rule.data_mapping.to_string(),
                enabled: true,
                priority: rule.priority,
                provenance: PROVENANCE_SEED.to_string(),
                confidence: 0.8,
                created_at: now,
                updated_at: now,
            })
            .execute(conn)?;
    }

    Ok(())
}
