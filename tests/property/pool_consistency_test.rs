// tests/property/pool_consistency_test.rs

//! Property-based tests for the connection pool.
//! Arbitrary sequences of pool operations keep the count and membership in step.

use crate::test_helpers::init_tracing;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tether::TetherError;
use tether::config::ExecutorConfig;
use tether::connection::Connection;
use tether::core::executor::{Executor, ThreadPool};
use tether::core::message::{Message, MessageKind};
use tether::session::{Session, SessionKind};
use tether::transport::{ConnId, LoopbackTransport, TransportConnection};

struct NullLink;

impl TransportConnection for NullLink {
    fn id(&self) -> ConnId {
        0
    }

    fn send(&self, _msg: Message) -> Result<(), TetherError> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
enum PoolOp {
    Accept,
    Remove(usize),
    Reinsert(usize),
    MoveToTail(usize),
    AcquireRelease,
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Accept),
        2 => any::<usize>().prop_map(PoolOp::Remove),
        1 => any::<usize>().prop_map(PoolOp::Reinsert),
        2 => any::<usize>().prop_map(PoolOp::MoveToTail),
        2 => Just(PoolOp::AcquireRelease),
    ]
}

fn server_session() -> Session {
    let executor: Arc<dyn Executor> = Arc::new(
        ThreadPool::new(&ExecutorConfig {
            max_threads: 2,
            thread_name: "tether-prop".into(),
            keep_alive: Duration::from_secs(1),
        })
        .unwrap(),
    );
    let session = Session::builder(
        SessionKind::Server,
        Arc::new(LoopbackTransport::new()),
        executor,
    )
    .build()
    .unwrap();
    session.activate().unwrap();
    session
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_pool_count_matches_membership(ops in prop::collection::vec(pool_op(), 1..=40)) {
        init_tracing();
        let session = server_session();
        let mut removed: Vec<Arc<Connection>> = Vec::new();

        for op in ops {
            let pooled = session.connections();
            match op {
                PoolOp::Accept => {
                    Connection::create_server_side(&session, Arc::new(NullLink)).unwrap();
                }
                PoolOp::Remove(i) if !pooled.is_empty() => {
                    let conn = pooled[i % pooled.len()].clone();
                    session.remove_connection(&conn).unwrap();
                    prop_assert!(session.remove_connection(&conn).is_err());
                    removed.push(conn);
                }
                PoolOp::Reinsert(i) if !removed.is_empty() => {
                    let conn = removed.remove(i % removed.len());
                    session.insert_connection(conn.clone()).unwrap();
                    prop_assert!(session.insert_connection(conn).is_err());
                }
                PoolOp::MoveToTail(i) if !pooled.is_empty() => {
                    let conn = pooled[i % pooled.len()].clone();
                    session.move_to_tail(&conn).unwrap();
                    let after = session.connections();
                    prop_assert_eq!(after.last().map(|c| c.id()), Some(conn.id()));
                }
                PoolOp::AcquireRelease if !pooled.is_empty() => {
                    let conn = session
                        .acquire_idle_connection(MessageKind::Request, Duration::from_millis(10))
                        .unwrap();
                    prop_assert!(conn.is_busy());
                    session.release_connection(&conn).unwrap();
                    prop_assert!(!conn.is_busy());
                }
                _ => {}
            }

            let pooled = session.connections();
            prop_assert_eq!(session.conn_num(), pooled.len());
            let ids: HashSet<_> = pooled.iter().map(|c| c.id()).collect();
            prop_assert_eq!(ids.len(), pooled.len());
            for conn in &removed {
                prop_assert!(!ids.contains(&conn.id()));
            }
            prop_assert!(pooled.iter().all(|c| !c.is_busy()));
        }
    }
}
