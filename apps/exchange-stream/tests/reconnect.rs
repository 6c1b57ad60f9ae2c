//! Connection Recovery Tests
//!
//! A dropped connection is redialed and its subscriptions restored; private
//! subscriptions wait for a fresh login first.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::timeout;

use common::{MockExchange, eventually, spot_catalog, test_config, trade};
use exchange_stream::WatchOptions;

/// `channel:instId` of every subscribe arg received so far.
fn subscribed(exchange: &MockExchange) -> Vec<String> {
    exchange
        .args("subscribe")
        .iter()
        .map(|a| {
            format!(
                "{}:{}",
                a["channel"].as_str().unwrap_or_default(),
                a["instId"].as_str().unwrap_or_default()
            )
        })
        .collect()
}

#[tokio::test]
async fn public_keys_are_restored_on_a_new_connection() {
    let exchange = MockExchange::start().await;
    let engine = exchange.engine(spot_catalog(), test_config());

    let trades = engine
        .watch_trades(&["BTC/USDT", "ETH/USDT"], &WatchOptions::default())
        .await
        .unwrap();
    eventually("first subscribe", || subscribed(&exchange).len() == 2).await;

    exchange.drop_connections();
    eventually("redial", || exchange.accepted() == 2).await;
    eventually("restored subscribe", || subscribed(&exchange).len() == 4).await;

    let restored: BTreeSet<String> = subscribed(&exchange)[2..].iter().cloned().collect();
    assert_eq!(
        restored,
        BTreeSet::from(["trades:BTC-USDT".to_string(), "trades:ETH-USDT".to_string()])
    );

    // The queue survived the reconnect and keeps flowing.
    assert!(!trades.is_closed());
    exchange.push(&trade("ETH-USDT", "after", "2000"));
    let trade = timeout(Duration::from_secs(2), trades.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trade.id, "after");
    assert_eq!(trade.symbol, "ETH/USDT");

    let stats = engine.subscription_stats();
    assert_eq!(stats[0].connections, 1);
    assert_eq!(stats[0].subscriptions.len(), 2);

    engine.close();
}

#[tokio::test]
async fn private_keys_wait_for_the_next_login() {
    let exchange = MockExchange::start().await;
    let engine = exchange.engine(spot_catalog(), test_config());

    let _balance = engine.watch_balance(&WatchOptions::default()).await.unwrap();
    eventually("first subscribe", || exchange.frames("subscribe").len() == 1).await;
    assert_eq!(exchange.frames("login").len(), 1);

    exchange.drop_connections();
    eventually("second login", || exchange.frames("login").len() == 2).await;
    eventually("restored subscribe", || exchange.frames("subscribe").len() == 2).await;

    assert_eq!(
        exchange.args("subscribe")[1]["channel"],
        "balance_and_position"
    );
    assert_eq!(exchange.accepted(), 2);

    engine.close();
}

#[tokio::test]
async fn private_restore_resends_exactly_the_watched_keys() {
    let exchange = MockExchange::start().await;
    let engine = exchange.engine(spot_catalog(), test_config());
    let options = WatchOptions::default();

    let _balance = engine.watch_balance(&options).await.unwrap();
    let _fills = engine.watch_my_trades(None, &options).await.unwrap();
    eventually("first subscribes", || exchange.args("subscribe").len() == 2).await;

    exchange.drop_connections();
    eventually("second login", || exchange.frames("login").len() == 2).await;
    eventually("restored subscribe", || exchange.args("subscribe").len() == 4).await;

    let restored: BTreeSet<String> = exchange.args("subscribe")[2..]
        .iter()
        .map(|a| a["channel"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        restored,
        BTreeSet::from(["balance_and_position".to_string(), "orders".to_string()])
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(exchange.args("subscribe").len(), 4);
    assert_eq!(exchange.frames("login").len(), 2);

    engine.close();
}

#[tokio::test]
async fn private_watch_during_reconnect_waits_for_the_new_login() {
    let exchange = MockExchange::start().await;
    let engine = exchange.engine(spot_catalog(), test_config());
    let options = WatchOptions::default();

    let _balance = engine.watch_balance(&options).await.unwrap();
    eventually("first subscribe", || exchange.frames("subscribe").len() == 1).await;

    exchange.drop_connections();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let _fills = engine.watch_my_trades(None, &options).await.unwrap();

    eventually("restored and new subscribe", || {
        exchange.args("subscribe").len() == 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One replacement connection, logged in before anything is subscribed on it.
    assert_eq!(exchange.accepted(), 2);
    assert_eq!(
        exchange.ops(),
        ["login", "subscribe", "login", "subscribe", "subscribe"]
    );
    let channels: BTreeSet<String> = exchange.args("subscribe")[1..]
        .iter()
        .map(|a| a["channel"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        channels,
        BTreeSet::from(["balance_and_position".to_string(), "orders".to_string()])
    );

    let stats = engine.subscription_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].connections, 1);
    assert_eq!(stats[0].subscriptions.len(), 2);

    engine.close();
}

#[tokio::test]
async fn unwatched_keys_are_not_restored() {
    let exchange = MockExchange::start().await;
    let engine = exchange.engine(spot_catalog(), test_config());
    let options = WatchOptions::default();

    let _trades = engine
        .watch_trades(&["BTC/USDT", "ETH/USDT"], &options)
        .await
        .unwrap();
    engine.unwatch_trades(&["ETH/USDT"], &options).await.unwrap();
    eventually("unsubscribe", || exchange.frames("unsubscribe").len() == 1).await;

    exchange.drop_connections();
    eventually("restored subscribe", || subscribed(&exchange).len() == 3).await;
    assert_eq!(subscribed(&exchange)[2], "trades:BTC-USDT");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscribed(&exchange).len(), 3);

    engine.close();
}

#[tokio::test]
async fn closed_engine_does_not_reconnect() {
    let exchange = MockExchange::start().await;
    let engine = exchange.engine(spot_catalog(), test_config());

    let trades = engine
        .watch_trades(&["BTC/USDT"], &WatchOptions::default())
        .await
        .unwrap();
    engine.close();
    assert!(trades.is_closed());

    exchange.drop_connections();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(exchange.accepted(), 1);
}
