use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use innkeep::tenant::TenantManager;
use innkeep::wire;

const PASSWORD: &str = "innkeep-test";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("innkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect_as(addr: SocketAddr, dbname: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("frontdesk")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "test", PASSWORD).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Room type with 2 units: 100.00 every night of January 2024,
/// 150.00 on Wednesdays and Thursdays at higher priority.
async fn seed(client: &Client) -> Ulid {
    let rt = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO room_types (id, name, units) VALUES ('{rt}', 'Garden Double', 2)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO rate_plans (id, room_type_id, start_date, end_date, dow_mask, closed, priority, base_rate) \
             VALUES ('{}', '{rt}', '2024-01-01', '2024-02-01', 127, false, 1, 10000)",
            Ulid::new()
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO rate_plans (id, room_type_id, start_date, end_date, dow_mask, closed, priority, base_rate) \
             VALUES ('{}', '{rt}', '2024-01-01', '2024-02-01', 12, false, 5, 15000)",
            Ulid::new()
        ))
        .await
        .unwrap();
    rt
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn quote_sums_nights() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let rt = seed(&client).await;

    // Wed 3rd .. Sat 6th: 150 + 150 + 100 + 100
    let result = rows(
        &client,
        &format!(
            "SELECT * FROM quote WHERE room_type_id = '{rt}' AND check_in = '2024-01-03' AND check_out = '2024-01-07'"
        ),
    )
    .await;
    assert_eq!(result.len(), 1);
    let row = &result[0];
    assert_eq!(row.get("nights"), Some("4"));
    assert_eq!(row.get("total"), Some("50000"));

    let breakdown: serde_json::Value = serde_json::from_str(row.get("breakdown").unwrap()).unwrap();
    let nights = breakdown.as_array().unwrap();
    assert_eq!(nights.len(), 4);
    assert_eq!(nights[0]["night"], "2024-01-03");
    assert_eq!(nights[0]["base_rate"], 15000);
    assert_eq!(nights[3]["night"], "2024-01-06");
    assert_eq!(nights[3]["total_rate"], 10000);
}

#[tokio::test]
async fn unpriced_night_fails_quote_but_shows_in_nightly_rates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let rt = seed(&client).await;

    // The 31st is priced, February is not.
    let err = client
        .simple_query(&format!(
            "SELECT * FROM quote WHERE room_type_id = '{rt}' AND check_in = '2024-01-31' AND check_out = '2024-02-02'"
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("2024-02-01"));

    let nights = rows(
        &client,
        &format!(
            "SELECT * FROM nightly_rates WHERE room_type_id = '{rt}' AND check_in = '2024-01-31' AND check_out = '2024-02-02'"
        ),
    )
    .await;
    assert_eq!(nights.len(), 2);
    assert_eq!(nights[0].get("total_rate"), Some("15000"));
    assert_eq!(nights[1].get("night"), Some("2024-02-01"));
    assert_eq!(nights[1].get("rate_plan_id"), None);
}

#[tokio::test]
async fn bookings_consume_units_until_sold_out() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let rt = seed(&client).await;

    for guest in ["Curie", "Noether"] {
        client
            .batch_execute(&format!(
                "INSERT INTO bookings (id, room_type_id, check_in, check_out, label) \
                 VALUES ('{}', '{rt}', '2024-01-10', '2024-01-12', '{guest}')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }

    let availability = rows(
        &client,
        &format!(
            "SELECT * FROM availability WHERE room_type_id = '{rt}' AND check_in = '2024-01-09' AND check_out = '2024-01-12'"
        ),
    )
    .await;
    let available: Vec<_> = availability.iter().map(|r| r.get("available").unwrap().to_string()).collect();
    assert_eq!(available, vec!["2", "0", "0"]);

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, room_type_id, check_in, check_out) VALUES ('{}', '{rt}', '2024-01-11', '2024-01-13')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("sold out"));

    let bookings = rows(&client, &format!("SELECT * FROM bookings WHERE room_type_id = '{rt}'")).await;
    assert_eq!(bookings.len(), 2);
    // Wed 10th at 150 + Thu 11th at 150
    assert!(bookings.iter().all(|b| b.get("total") == Some("30000")));
}

#[tokio::test]
async fn hold_then_release_frees_unit() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let rt = seed(&client).await;

    let hold = Ulid::new();
    let expires_at = i64::MAX / 2;
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, room_type_id, check_in, check_out, expires_at) \
             VALUES ('{hold}', '{rt}', '2024-01-20', '2024-01-21', {expires_at})"
        ))
        .await
        .unwrap();
    let holds = rows(&client, &format!("SELECT * FROM holds WHERE room_type_id = '{rt}'")).await;
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].get("id"), Some(hold.to_string().as_str()));

    client
        .batch_execute(&format!("DELETE FROM holds WHERE id = '{hold}'"))
        .await
        .unwrap();
    assert!(rows(&client, &format!("SELECT * FROM holds WHERE room_type_id = '{rt}'")).await.is_empty());
}

#[tokio::test]
async fn closed_plan_stops_sale() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let rt = seed(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO rate_plans VALUES ('{}', '{rt}', '2024-01-15', '2024-01-16', 127, true, 99, 0)",
            Ulid::new()
        ))
        .await
        .unwrap();

    // Closed plans are skipped, the open ones still price the night.
    let nights = rows(
        &client,
        &format!(
            "SELECT * FROM nightly_rates WHERE room_type_id = '{rt}' AND check_in = '2024-01-15' AND check_out = '2024-01-16'"
        ),
    )
    .await;
    assert_eq!(nights[0].get("base_rate"), Some("10000"));

    let plans = rows(&client, &format!("SELECT * FROM rate_plans WHERE room_type_id = '{rt}'")).await;
    assert_eq!(plans.len(), 3);
    assert!(plans.iter().any(|p| matches!(p.get("closed"), Some("t") | Some("true"))));
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server().await;
    let a = connect_as(addr, "hotel_a", PASSWORD).await.unwrap();
    let b = connect_as(addr, "hotel_b", PASSWORD).await.unwrap();

    seed(&a).await;
    assert_eq!(rows(&a, "SELECT * FROM room_types").await.len(), 1);
    assert!(rows(&b, "SELECT * FROM room_types").await.is_empty());
}

#[tokio::test]
async fn wrong_password_rejected() {
    let addr = start_test_server().await;
    assert!(connect_as(addr, "test", "not-the-password").await.is_err());
}

#[tokio::test]
async fn syntax_error_reported() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let err = client.simple_query("SELECT * FROM lobby").await.unwrap_err();
    assert_eq!(err.as_db_error().unwrap().message(), "unknown table: lobby");
}

#[tokio::test]
async fn bound_parameters_are_inserted_verbatim() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let rt = seed(&client).await;

    let booking_id = Ulid::new().to_string();
    let rt_text = rt.to_string();
    client
        .execute(
            "INSERT INTO bookings (id, room_type_id, check_in, check_out, label) VALUES ($1, $2, $3, $4, $5)",
            &[&booking_id, &rt_text, &"2024-01-08", &"2024-01-10", &"Room $1 promo, O'Brien"],
        )
        .await
        .unwrap();

    let bookings = rows(&client, &format!("SELECT * FROM bookings WHERE room_type_id = '{rt}'")).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("id"), Some(booking_id.as_str()));
    assert_eq!(bookings[0].get("label"), Some("Room $1 promo, O'Brien"));
}
