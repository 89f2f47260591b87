use odata_core::command::CommandModel;
use odata_core::compiler::{render_filter, CommandCompiler};
use odata_core::dynamic::{expression, DynamicExpression};
use odata_core::error::{Error, ErrorType};
use odata_core::expression::ExpressionSource;
use odata_core::metadata::ServiceModel;
use odata_core::parse::parse_filter;
use odata_core::value::{ProtocolRevision, Value};
use odata_macro::lambda;

#[derive(serde_derive::Serialize)]
struct Criteria {
    name: String,
    min_price: f64,
}

#[test]
fn typed_and_dynamic_produce_the_same_tree() -> Result<(), Error> {
    let x = expression();
    let pairs = vec![
        (
            lambda!(|x| x.ProductID == 1).to_expression()?,
            x.member("ProductID").equal(1).expression()?,
        ),
        (
            lambda!(|x| x.Category.CategoryName == "Beverages" && !x.Discontinued).to_expression()?,
            (x.member("Category").member("CategoryName").equal("Beverages") & !x.member("Discontinued"))
                .expression()?,
        ),
        (
            lambda!(|x| x.ProductName.starts_with("Ch") || x.ProductName.Length > 4).to_expression()?,
            (x.member("ProductName").call("starts_with", vec!["Ch".into()])
                | x.member("ProductName").member("Length").greater_than(4))
            .expression()?,
        ),
        (
            lambda!(|x| x.UnitPrice * 2 - 1 >= 10).to_expression()?,
            ((x.member("UnitPrice") * 2 - 1).greater_or_equal(10)).expression()?,
        ),
    ];
    for (typed, dynamic) in pairs {
        assert_eq!(typed, dynamic);
    }
    Ok(())
}

#[test]
fn captured_values_become_literals() -> Result<(), Error> {
    let criteria = Criteria {
        name: "Chai".to_owned(),
        min_price: 2.5,
    };
    let product_id = 3;
    let e = lambda!(|p| p.ProductName == criteria.name && p.UnitPrice > criteria.min_price
        || p.ProductID == product_id)
    .to_expression()?;
    assert_eq!(
        render_filter(&e, ProtocolRevision::V4)?,
        "ProductName eq 'Chai' and UnitPrice gt 2.5 or ProductID eq 3"
    );
    let long_id = 3i64;
    let e = lambda!(|p| p.ProductID == long_id).to_expression()?;
    assert!(matches!(
        &e,
        odata_core::expression::Expression::Binary { right, .. }
            if right.as_literal() == Some(&Value::Int64(3))
    ));
    Ok(())
}

#[test]
fn captured_values_match_constants() -> Result<(), Error> {
    let guid = uuid::Uuid::nil();
    let price = rust_decimal::Decimal::new(125, 2);
    let since = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
        .and_then(|d| d.and_hms_opt(3, 4, 5))
        .ok_or_else(|| Error::general_error("date".to_owned()))?;
    let picture = vec![0x0au8, 0x0b];
    let x = expression();
    let pairs = vec![
        (
            lambda!(|p| p.Id == guid).to_expression()?,
            x.member("Id").equal(guid).expression()?,
        ),
        (
            lambda!(|p| p.Price == price).to_expression()?,
            x.member("Price").equal(price).expression()?,
        ),
        (
            lambda!(|p| p.Since == since).to_expression()?,
            x.member("Since").equal(since).expression()?,
        ),
        (
            lambda!(|p| p.Picture == picture).to_expression()?,
            x.member("Picture")
                .equal(Value::Binary(vec![0x0a, 0x0b]))
                .expression()?,
        ),
    ];
    for (typed, dynamic) in pairs {
        assert_eq!(typed, dynamic);
    }
    let e = lambda!(|p| p.Id == guid && p.Price == price && p.Since == since).to_expression()?;
    assert_eq!(
        render_filter(&e, ProtocolRevision::V3)?,
        "Id eq guid'00000000-0000-0000-0000-000000000000' and Price eq 1.25M \
         and Since eq datetime'2024-01-02T03:04:05'"
    );
    Ok(())
}

#[test]
fn typed_filter_compiles_with_key_collapse() -> Result<(), Error> {
    let model = ServiceModel::from_yaml(include_str!("data/northwind.yaml"))?;
    let compiler = CommandCompiler::new(&model);
    let id = 1;
    let command = CommandModel::for_collection("Products").filter(lambda!(|x| x.ProductID == id));
    assert_eq!(compiler.compile_text(&command)?, "Products(1)");
    let long_id: i64 = 1;
    let command = CommandModel::for_collection("Products").filter(lambda!(|x| x.ProductID == long_id));
    assert_eq!(
        CommandCompiler::new(&model)
            .with_revision(ProtocolRevision::V3)
            .compile_text(&command)?,
        "Products(1L)"
    );
    let command = CommandModel::for_collection("Products")
        .filter(lambda!(|x| x.ProductName.contains("ai")))
        .select_projection(&lambda!(|x| Row {
            name: x.ProductName,
            category: x.Category.CategoryName
        }));
    let text = CommandCompiler::new(&model)
        .with_revision(ProtocolRevision::V3)
        .compile_text(&command)?;
    assert!(text.starts_with("Products?$filter=substringof%28%27ai%27%2CProductName%29"));
    assert!(text.contains("$select=ProductName%2CCategory%2FCategoryName"));
    Ok(())
}

#[test]
fn unsupported_typed_expressions_are_reported() -> Result<(), Error> {
    let e = lambda!(|x| x.ProductName.sort() == "a").to_expression()?;
    assert_eq!(
        render_filter(&e, ProtocolRevision::V4).err().map(|e| e.error_type),
        Some(ErrorType::UnsupportedFunction)
    );
    let e = lambda!(|x| x.ProductName.starts_with(x.CategoryName)).to_expression();
    assert_eq!(
        e.err().map(|e| e.error_type),
        Some(ErrorType::UnsupportedExpression)
    );
    Ok(())
}

#[test]
fn rendered_filters_parse_back() -> Result<(), Error> {
    let x = expression();
    let filters = vec![
        x.member("ProductID").equal(1) & x.member("ProductName").equal("O'Neil"),
        (x.member("A").equal(1) | x.member("B").equal(2)) & x.member("C").less_than(3),
        !x.member("Discontinued").equal(true),
        x.member("Category").member("CategoryName").not_equal("Beverages"),
        x.member("ProductName").call("contains", vec!["ai".into()]),
        (x.member("UnitPrice") - (x.member("Discount") + 1)).greater_than(5),
        x.member("Price").equal(1.5),
        x.member("Stock").greater_than(-DynamicExpression::from(5)),
        x.member("Stock").less_than(-(x.member("Reorder") + 1)),
    ];
    for revision in [ProtocolRevision::V3, ProtocolRevision::V4] {
        for filter in &filters {
            let expected = filter.expression()?;
            let text = render_filter(&expected, revision)?;
            assert_eq!(parse_filter(&text, revision)?, expected, "{}", text);
        }
    }
    Ok(())
}
