//! The pipelines this loader knows how to run.

use crate::dimension::{DimensionMode, DimensionSpec};
use crate::error::PlanError;
use crate::fact::{Derived, FactPolicy, FactSpec};
use crate::normalizer::{parse_date, Coercion, ExplodeGroup, NormalizerConfig, SourceRecord, SourceWindow};
use crate::pipeline::PipelineDefinition;
use crate::resolver::{BridgeSpec, ResolveStep};
use crate::schema::{Column, ColumnType, TableSchema};
use crate::source::{join_records, unnest};
use crate::staging::WriteMode;
use chrono::Datelike;
use serde_json::Value as Json;
use std::fmt;
use std::str::FromStr;

pub const MASKED: &str = "***Masked***";

pub const PIPELINES: &[&str] = &["product_reviews", "store_sales", "movies"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Full extract: staging replaced, existing dimension keys left untouched.
    Initial,
    /// Yesterday's changes: staging appended, dimensions upserted, audited.
    Incremental,
}

impl Variant {
    fn write_mode(self) -> WriteMode {
        match self {
            Variant::Initial => WriteMode::Replace,
            Variant::Incremental => WriteMode::Append,
        }
    }

    fn dimension_mode(self) -> DimensionMode {
        match self {
            Variant::Initial => DimensionMode::InsertOnly,
            Variant::Incremental => DimensionMode::Upsert,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Initial => write!(f, "initial"),
            Variant::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initial" => Ok(Variant::Initial),
            "incremental" => Ok(Variant::Incremental),
            other => Err(format!("unknown variant '{}' (expected initial or incremental)", other)),
        }
    }
}

/// Look a pipeline up by name.
pub fn definition(name: &str, variant: Variant) -> Result<PipelineDefinition, PlanError> {
    match name {
        "product_reviews" => product_reviews(variant),
        "store_sales" => store_sales(variant),
        "movies" => movies(variant),
        other => Err(PlanError::Invalid(format!(
            "unknown pipeline '{}' (known: {})",
            other,
            PIPELINES.join(", ")
        ))),
    }
}

// -----------------------------------------------------------------------------
// PRODUCT REVIEWS
// -----------------------------------------------------------------------------

/// Product listings where one row carries every review of the product as
/// comma-joined `user_id`, `user_name`, `review_id` and `review_title`.
pub fn product_reviews(variant: Variant) -> Result<PipelineDefinition, PlanError> {
    let mode = variant.dimension_mode();
    let record = TableSchema::new("product_review").columns([
        Column::required("product_id", ColumnType::Text),
        Column::text("product_name"),
        Column::text("category"),
        Column::float("discounted_price"),
        Column::float("actual_price"),
        Column::text("discount_percentage"),
        Column::text("rating"),
        Column::integer("rating_count"),
        Column::text("about_product"),
        Column::text("user_id"),
        Column::text("user_name"),
        Column::text("review_id"),
        Column::text("review_title"),
        Column::text("img_link"),
        Column::text("product_link"),
        Column::date("modified_date"),
    ]);

    let normalizer = NormalizerConfig::new()
        .explode(ExplodeGroup::new(&["user_id", "user_name", "review_id", "review_title"]))
        .coerce("discounted_price", Coercion::Amount)
        .coerce("actual_price", Coercion::Amount)
        .default_value("rating_count", 1_i64);

    let product = DimensionSpec::new("dim_product", "product_key", mode)
        .key("product_id", Column::new("product_id", ColumnType::Text))
        .attribute("product_name", Column::text("product_name"))
        .attribute("category", Column::text("category"))
        .attribute("about_product", Column::text("about_product"))
        .attribute("img_link", Column::text("img_link"))
        .attribute("product_link", Column::text("product_link"))
        .attribute("rating", Column::text("rating"))
        .attribute("rating_count", Column::integer("rating_count"));

    let user = DimensionSpec::new("dim_user", "user_key", mode)
        .key("user_id", Column::new("user_id", ColumnType::Text))
        .attribute("user_name", Column::text("user_name"));

    let review = DimensionSpec::new("dim_review", "review_key", mode)
        .key("review_id", Column::new("review_id", ColumnType::Text))
        .attribute("review_title", Column::text("review_content"))
        .reference("product_key")
        .reference("user_key");

    let fact = FactSpec::new("fact_price", "price_key", FactPolicy::MergeOn(vec!["product_key".to_string()]))
        .foreign_key("product_key", "product_key")
        .measure("actual_price", Column::float("actual_price"))
        .measure("discounted_price", Column::float("discounted_price"))
        .measure("discount_percentage", Column::text("discount_percentage"))
        .dated();

    let mut builder = PipelineDefinition::builder("product_reviews", "stg_product_review", record, fact)
        .normalizer(normalizer)
        .write_mode(variant.write_mode())
        .dimension(product)
        .dimension(user)
        .dimension(review)
        .step(ResolveStep::lookup(
            "dim_product",
            &[("product_id", "product_id"), ("product_name", "product_name")],
            "product_key",
        ))
        .step(ResolveStep::lookup(
            "dim_user",
            &[("user_id", "user_id"), ("user_name", "user_name")],
            "user_key",
        ))
        .step(ResolveStep::lookup(
            "dim_review",
            &[("review_id", "review_id"), ("review_title", "review_content")],
            "review_key",
        ))
        .step(ResolveStep::propagate(
            "dim_review",
            &[("review_id", "review_id")],
            "product_key",
            "product_key",
        ))
        .step(ResolveStep::propagate(
            "dim_review",
            &[("review_id", "review_id")],
            "user_key",
            "user_key",
        ))
        .bridge(BridgeSpec::new(
            "product_user_join",
            &[("product_key", "product_key"), ("user_key", "user_key")],
        ))
        .audit(variant == Variant::Incremental);

    if variant == Variant::Incremental {
        builder = builder.window(SourceWindow::new("modified_date", 1));
    }
    builder.build()
}

// -----------------------------------------------------------------------------
// STORE SALES
// -----------------------------------------------------------------------------

/// Cart lines joined to their product and user, ready for `store_sales`.
///
/// Each cart is split into one record per `products` entry, then looked up
/// against products (`productId = id`) and users (`userId = id`). Lines whose
/// product or user is unknown are dropped by the inner joins. `month` and
/// `year` are derived from the cart date.
pub fn store_sales_records(
    carts: &[SourceRecord],
    products: &[SourceRecord],
    users: &[SourceRecord],
) -> Vec<SourceRecord> {
    let lines = unnest(carts, "products");
    let with_products = join_records(&lines, products, "productId", "id");
    let mut joined = join_records(&with_products, users, "userId", "id");
    for record in &mut joined {
        let date = record.get("date").and_then(Json::as_str).and_then(parse_date);
        if let Some(date) = date {
            record.insert("month".to_string(), Json::from(date.month()));
            record.insert("year".to_string(), Json::from(date.year()));
        }
    }
    joined
}

pub fn store_sales(variant: Variant) -> Result<PipelineDefinition, PlanError> {
    let mode = variant.dimension_mode();
    let record = TableSchema::new("store_sale").columns([
        Column::required("id", ColumnType::Integer),
        Column::integer("userId"),
        Column::date("date"),
        Column::integer("month"),
        Column::integer("year"),
        Column::integer("productId"),
        Column::integer("quantity"),
        Column::text("title"),
        Column::float("price"),
        Column::text("description"),
        Column::text("category"),
        Column::text("image"),
        Column::float("rate"),
        Column::integer("count"),
        Column::text("email"),
        Column::text("username"),
        Column::text("password"),
        Column::text("phone"),
        Column::text("firstname"),
        Column::text("lastname"),
        Column::text("city"),
        Column::text("street"),
        Column::integer("number"),
        Column::text("zipcode"),
        Column::text("latitude"),
        Column::text("longitude"),
    ]);

    let normalizer = NormalizerConfig::new()
        .lift("rating")
        .lift("name")
        .lift("address")
        .rename("geolocation.lat", "latitude")
        .rename("geolocation.long", "longitude")
        .coerce("firstname", Coercion::Capitalize)
        .coerce("lastname", Coercion::Capitalize)
        .coerce("street", Coercion::TitleCase)
        .coerce("email", Coercion::Mask(MASKED.to_string()))
        .coerce("username", Coercion::Mask(MASKED.to_string()))
        .coerce("password", Coercion::Mask(MASKED.to_string()))
        .coerce("phone", Coercion::Mask(MASKED.to_string()));

    let product = DimensionSpec::new("dim_product", "product_key", mode)
        .key("productId", Column::new("product_id", ColumnType::Integer))
        .attribute("title", Column::text("product_name"))
        .attribute("description", Column::text("description"))
        .attribute("category", Column::text("category"))
        .attribute("image", Column::text("image"))
        .attribute("rate", Column::float("rating"));

    let user = DimensionSpec::new("dim_user", "user_key", mode)
        .key("userId", Column::new("user_id", ColumnType::Integer))
        .attribute("email", Column::text("email"))
        .attribute("username", Column::text("username"))
        .attribute("password", Column::text("password"))
        .attribute("phone", Column::text("phone"))
        .attribute("firstname", Column::text("firstname"))
        .attribute("lastname", Column::text("lastname"))
        .attribute("street", Column::text("street"))
        .attribute("number", Column::integer("number"))
        .attribute("zipcode", Column::text("zipcode"))
        .attribute("latitude", Column::text("latitude"))
        .attribute("longitude", Column::text("longitude"))
        .reference("city_key");

    let date = DimensionSpec::new("dim_date", "date_key", mode)
        .key("date", Column::new("sale_date", ColumnType::Date))
        .attribute("month", Column::integer("month"))
        .attribute("year", Column::integer("year"));

    let city = DimensionSpec::new("dim_city", "city_key", mode).key("city", Column::new("city", ColumnType::Text));

    let fact = FactSpec::new("fact_sale", "sale_key", FactPolicy::Append)
        .foreign_key("product_key", "product_key")
        .foreign_key("user_key", "user_key")
        .foreign_key("date_key", "date_key")
        .measure("id", Column::integer("sale_id"))
        .measure("price", Column::float("price"))
        .measure("quantity", Column::integer("quantity"))
        .measure("count", Column::integer("stock"))
        .derive(Derived::product("total_sale", "price", "quantity"))
        .dated();

    PipelineDefinition::builder("store_sales", "stg_combo_table", record, fact)
        .normalizer(normalizer)
        .write_mode(variant.write_mode())
        .dimension(product)
        .dimension(user)
        .dimension(date)
        .dimension(city)
        .step(ResolveStep::lookup("dim_product", &[("productId", "product_id")], "product_key"))
        .step(ResolveStep::lookup("dim_user", &[("userId", "user_id")], "user_key"))
        .step(ResolveStep::lookup("dim_date", &[("date", "sale_date")], "date_key"))
        .step(ResolveStep::lookup("dim_city", &[("city", "city")], "city_key"))
        .step(ResolveStep::propagate("dim_user", &[("userId", "user_id")], "city_key", "city_key"))
        .audit(variant == Variant::Incremental)
        .build()
}

// -----------------------------------------------------------------------------
// MOVIES
// -----------------------------------------------------------------------------

/// Top-rated movies: comma-joined `genre`, four star columns.
pub fn movies(variant: Variant) -> Result<PipelineDefinition, PlanError> {
    let mode = variant.dimension_mode();
    let record = TableSchema::new("movie").columns([
        Column::required("series_title", ColumnType::Text),
        Column::integer("released_year"),
        Column::text("certificate"),
        Column::text("runtime"),
        Column::text("genre"),
        Column::float("imdb_rating"),
        Column::text("overview"),
        Column::integer("meta_score"),
        Column::text("director"),
        Column::text("actor_name"),
        Column::integer("no_of_votes"),
        Column::float("gross"),
    ]);

    let normalizer = NormalizerConfig::new()
        .explode(ExplodeGroup::new(&["genre"]))
        .unpivot(&["star1", "star2", "star3", "star4"], "actor_name")
        .coerce("gross", Coercion::Amount)
        .coerce("no_of_votes", Coercion::Integer)
        .default_value("meta_score", 0_i64)
        .default_value("gross", 0.0)
        .default_value("no_of_votes", 0_i64)
        .default_value("certificate", "NA")
        .default_value("overview", "NA");

    let movie = DimensionSpec::new("dim_movie", "movie_key", mode)
        .key("series_title", Column::new("series_title", ColumnType::Text))
        .key("released_year", Column::new("released_year", ColumnType::Integer))
        .attribute("runtime", Column::text("runtime"))
        .attribute("overview", Column::text("overview"))
        .attribute("certificate", Column::text("certificate"))
        .attribute("imdb_rating", Column::float("imdb_rating"))
        .attribute("meta_score", Column::integer("meta_score"))
        .reference("director_key");

    let director =
        DimensionSpec::new("dim_director", "director_key", mode).key("director", Column::new("director", ColumnType::Text));
    let actor =
        DimensionSpec::new("dim_actor", "actor_key", mode).key("actor_name", Column::new("actor_name", ColumnType::Text));
    let genre = DimensionSpec::new("dim_genre", "genre_key", mode).key("genre", Column::new("genre", ColumnType::Text));

    let fact = FactSpec::new("fact_gross", "gross_key", FactPolicy::Append)
        .foreign_key("movie_key", "movie_key")
        .foreign_key("actor_key", "actor_key")
        .foreign_key("director_key", "director_key")
        .measure("gross", Column::float("gross"))
        .measure("no_of_votes", Column::integer("no_of_votes"))
        .distinct()
        .dated();

    PipelineDefinition::builder("movies", "stg_movies", record, fact)
        .normalizer(normalizer)
        .write_mode(variant.write_mode())
        .dimension(director)
        .dimension(actor)
        .dimension(movie)
        .dimension(genre)
        .step(ResolveStep::lookup("dim_director", &[("director", "director")], "director_key"))
        .step(ResolveStep::lookup("dim_actor", &[("actor_name", "actor_name")], "actor_key"))
        .step(ResolveStep::lookup(
            "dim_movie",
            &[("series_title", "series_title"), ("released_year", "released_year")],
            "movie_key",
        ))
        .step(ResolveStep::lookup("dim_genre", &[("genre", "genre")], "genre_key"))
        .step(ResolveStep::propagate(
            "dim_movie",
            &[("series_title", "series_title"), ("released_year", "released_year")],
            "director_key",
            "director_key",
        ))
        .bridge(BridgeSpec::new(
            "director_actor",
            &[("director_key", "director_key"), ("actor_key", "actor_key")],
        ))
        .bridge(BridgeSpec::new("actor_movie", &[("actor_key", "actor_key"), ("movie_key", "movie_key")]))
        .bridge(BridgeSpec::new("genre_movie", &[("genre_key", "genre_key"), ("movie_key", "movie_key")]))
        .audit(variant == Variant::Incremental)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use crate::source::read_json;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("product_reviews", Variant::Initial)]
    #[case("product_reviews", Variant::Incremental)]
    #[case("store_sales", Variant::Initial)]
    #[case("store_sales", Variant::Incremental)]
    #[case("movies", Variant::Initial)]
    #[case("movies", Variant::Incremental)]
    fn test_every_definition_builds(#[case] name: &str, #[case] variant: Variant) {
        let def = definition(name, variant).unwrap();
        assert_eq!(def.name, name);
        assert_eq!(def.audit, variant == Variant::Incremental);
        assert_eq!(def.stages().contains(&Stage::Audit), variant == Variant::Incremental);
    }

    #[test]
    fn test_unknown_pipeline() {
        assert!(matches!(definition("nope", Variant::Initial), Err(PlanError::Invalid(_))));
    }

    #[test]
    fn test_variant_from_str() {
        assert_eq!("Incremental".parse::<Variant>().unwrap(), Variant::Incremental);
        assert!("weekly".parse::<Variant>().is_err());
    }

    #[test]
    fn test_incremental_reviews_use_window_and_append() {
        let def = product_reviews(Variant::Incremental).unwrap();
        assert_eq!(def.window, Some(SourceWindow::new("modified_date", 1)));
        assert_eq!(def.write_mode, WriteMode::Append);
        assert!(def.dimensions.iter().all(|d| d.mode == DimensionMode::Upsert));

        let initial = product_reviews(Variant::Initial).unwrap();
        assert!(initial.window.is_none());
        assert!(initial.dimensions.iter().all(|d| d.mode == DimensionMode::InsertOnly));
    }

    #[test]
    fn test_movie_bridges_in_order() {
        let def = movies(Variant::Initial).unwrap();
        let names: Vec<&str> = def.bridges.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["director_actor", "actor_movie", "genre_movie"]);
    }

    #[test]
    fn test_store_sales_records_join_and_unnest() {
        let carts = read_json(
            br#"[{"id": 1, "userId": 1, "date": "2020-03-02T00:00:00.000Z",
                  "products": [{"productId": 1, "quantity": 4}, {"productId": 2, "quantity": 1}, {"productId": 9, "quantity": 1}]}]"#,
        )
        .unwrap();
        let products =
            read_json(br#"[{"id": 1, "title": "Backpack", "price": 109.95}, {"id": 2, "title": "Shirt", "price": 22.3}]"#)
                .unwrap();
        let users = read_json(br#"[{"id": 1, "email": "john@gmail.com"}]"#).unwrap();

        let records = store_sales_records(&carts, &products, &users);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("id"), Some(&json!(1)));
        assert_eq!(records[0].get("title"), Some(&json!("Backpack")));
        assert_eq!(records[1].get("email"), Some(&json!("john@gmail.com")));
        assert_eq!(records[0].get("month"), Some(&json!(3)));
        assert_eq!(records[0].get("year"), Some(&json!(2020)));
    }

    #[test]
    fn test_store_sales_masks_and_flattens() {
        let def = store_sales(Variant::Initial).unwrap();
        let record = read_json(
            br#"[{"id": 1, "userId": 1, "date": "2020-03-02", "productId": 1, "quantity": 4,
                  "title": "Backpack", "price": 109.95, "rating": {"rate": 3.9, "count": 120},
                  "email": "john@gmail.com", "password": "m38rmF$", "phone": "1-570-236-7033",
                  "name": {"firstname": "JOHN", "lastname": "doe"},
                  "address": {"city": "kilcoole", "street": "new road", "number": 7682, "zipcode": "12926-3874",
                              "geolocation": {"lat": "-37.3159", "long": "81.1496"}}}]"#,
        )
        .unwrap();
        let rows = def.normalizer.normalize(&record[0]).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("firstname").as_text(), Some("John"));
        assert_eq!(row.get("lastname").as_text(), Some("Doe"));
        assert_eq!(row.get("street").as_text(), Some("New Road"));
        assert_eq!(row.get("password").as_text(), Some(MASKED));
        assert_eq!(row.get("phone").as_text(), Some(MASKED));
        assert_eq!(row.get("latitude").as_text(), Some("-37.3159"));
        assert_eq!(row.get("rate").as_f64(), Some(3.9));
        assert_eq!(row.get("count").as_i64(), Some(120));
    }

    #[test]
    fn test_movies_explode_genre_then_unpivot_stars() {
        let def = movies(Variant::Initial).unwrap();
        let record = read_json(
            br#"[{"series_title": "The Dark Knight", "released_year": "2008", "genre": "Action, Crime, Drama",
                  "director": "Christopher Nolan", "star1": "Christian Bale", "star2": "Heath Ledger",
                  "star3": "Aaron Eckhart", "star4": "Michael Caine", "gross": "534,858,444", "no_of_votes": "2303232"}]"#,
        )
        .unwrap();
        let rows = def.normalizer.normalize(&record[0]).unwrap();
        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0].get("genre").as_text(), Some("Action"));
        assert_eq!(rows[0].get("actor_name").as_text(), Some("Christian Bale"));
        assert_eq!(rows[4].get("genre").as_text(), Some("Crime"));
        assert_eq!(rows[0].get("gross").as_f64(), Some(534_858_444.0));
        assert_eq!(rows[0].get("certificate").as_text(), Some("NA"));
        assert_eq!(rows[0].get("meta_score").as_i64(), Some(0));
    }
}
