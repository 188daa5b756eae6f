use redis::AsyncCommands;

// Fast-path dedup marker for already-ingested message ids. The Firestore
// create precondition remains the authoritative guard; losing Redis only
// costs an extra round trip.

fn key(message_id: &str) -> String {
    format!("shaken:ingested:{message_id}")
}

pub async fn seen(client: &redis::Client, message_id: &str) -> bool {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return false,
    };
    conn.exists(key(message_id)).await.unwrap_or(false)
}

pub async fn mark(client: &redis::Client, message_id: &str) {
    let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(86_400);
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
        let _: Result<(), _> = conn.set_ex(key(message_id), 1u8, ttl).await;
    }
}
