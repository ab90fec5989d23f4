use grpc_client_core::rpc::{ConnFactory, ConnFactorySettings};
use std::sync::Arc;
use std::time::Duration;
use testing_service::Reflection;

#[tokio::test]
async fn test_concurrent_callers_share_one_connection() {
    let addr = testing_service::spawn_server(Reflection::None)
        .await
        .unwrap();
    let factory = Arc::new(ConnFactory::new(ConnFactorySettings {
        keepalive: true,
        keepalive_time: Some(Duration::from_secs(30)),
        max_recv_msg_size: Some(1024 * 1024),
        ..Default::default()
    }));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let factory = factory.clone();
            let target = if i % 2 == 0 {
                addr.to_string()
            } else {
                format!("host={addr},authority=svc.local,metadata=k:{i}")
            };
            tokio::spawn(async move { factory.get_conn(&target).await.unwrap() })
        })
        .collect();

    let mut conns = Vec::new();
    for handle in handles {
        conns.push(handle.await.unwrap());
    }

    assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[tokio::test]
async fn test_close_drops_every_connection() {
    let factory = ConnFactory::default();

    let a = factory.get_conn("localhost:50061").await.unwrap();
    let b = factory.get_conn("localhost:50062").await.unwrap();

    factory.close();

    assert!(!Arc::ptr_eq(&a, &factory.get_conn("localhost:50061").await.unwrap()));
    assert!(!Arc::ptr_eq(&b, &factory.get_conn("localhost:50062").await.unwrap()));
}
