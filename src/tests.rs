//! Session behaviour against the in-memory driver.

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::config::{IdentityMapperSetting, IsolationLevel, SessionConfig};
use crate::driver::{DriverError, Handle, TransactionStatus};
use crate::error::{ConnectionError, TransactionOp};
use crate::identity::{IdentityMapper, IdentityMappers, SmartIdentityMapper};
use crate::log::{Level, LogContext, SESSION_KEY};
use crate::map::{MapContext, MapFactories};
use crate::mock::{MockDriver, RecordingSink};
use crate::pg::types::{Oid, Value};
use crate::session::Session;
use crate::statement::Signature;

fn config() -> SessionConfig {
    SessionConfig::new("app", "shop")
}

fn session_with(config: SessionConfig) -> (Session<MockDriver>, MockDriver, Arc<RecordingSink>) {
    let driver = MockDriver::new();
    let sink = RecordingSink::new();
    let session = Session::builder(config)
        .driver(driver.clone())
        .logger(sink.clone())
        .build()
        .unwrap();
    (session, driver, sink)
}

fn session() -> (Session<MockDriver>, MockDriver, Arc<RecordingSink>) {
    session_with(config())
}

// ============================================================================
// Handle lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_handle_is_opened_once() {
        let (mut session, driver, _) = session();
        assert!(!session.is_connected());

        for _ in 0..3 {
            session.handle().unwrap();
        }

        assert!(session.is_connected());
        assert_eq!(driver.state().connects, 1);
        assert_eq!(driver.state().released, 0);
        assert_eq!(driver.state().targets, vec!["user=app dbname=shop".to_string()]);
    }

    #[test]
    fn test_reconnect_opens_a_second_handle() {
        let (mut session, driver, _) = session();
        let first = session.handle().unwrap().id;
        let second = session.reconnect().unwrap().id;

        assert_ne!(first, second);
        assert_eq!(driver.state().connects, 2);
        assert_eq!(driver.state().released, 1);

        drop(session);
        assert_eq!(driver.state().released, 2);
    }

    #[test]
    fn test_dropping_unconnected_session_releases_nothing() {
        let (session, driver, _) = session();
        drop(session);
        assert_eq!(driver.state().connects, 0);
        assert_eq!(driver.state().released, 0);
    }

    #[test]
    fn test_connect_failure_logs_alert() {
        let (mut session, driver, sink) = session_with(config().host("db").password("s3cret"));
        driver.state().fail_connect = true;

        let err = session.handle().err().unwrap();
        match &err {
            ConnectionError::Establishment { dsn, source } => {
                assert_eq!(dsn, "user=app dbname=shop host=db password=***");
                assert!(matches!(source, DriverError::Io(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!session.is_connected());
        assert_eq!(sink.levels(), vec![Level::Alert]);
        let (_, message, _) = &sink.records()[0];
        assert!(!message.contains("s3cret"));
    }

    #[test]
    fn test_settings_applied_in_one_batch() {
        let (mut session, driver, _) = session_with(
            config()
                .setting("datestyle", "ISO, DMY")
                .setting("search_path", "shop"),
        );
        session.handle().unwrap();

        assert_eq!(
            driver.state().executed,
            vec!["SET datestyle = \"ISO, DMY\";SET search_path = \"shop\";".to_string()]
        );
    }

    #[test]
    fn test_no_settings_no_statement() {
        let (mut session, driver, _) = session();
        session.handle().unwrap();
        assert!(driver.state().executed.is_empty());
    }

    #[test]
    fn test_settings_failure_logs_critical() {
        let (mut session, driver, sink) = session_with(config().setting("datestyle", "ISO"));
        driver.state().fail_on = Some("datestyle".to_string());

        let err = session.handle().err().unwrap();
        assert!(matches!(err, ConnectionError::SessionConfiguration { .. }));
        assert_eq!(err.sql(), Some("SET datestyle = \"ISO\";"));
        assert_eq!(sink.levels(), vec![Level::Critical]);

        // the half-configured handle is not kept
        assert!(!session.is_connected());
        assert_eq!(driver.state().released, 1);
    }
}

// ============================================================================
// Statement cache
// ============================================================================

mod statements {
    use super::*;

    #[test]
    fn test_get_query_returns_cached_statement() {
        let (mut session, driver, _) = session();
        let sql = "SELECT * FROM post WHERE id = $1";

        assert!(!session.has_query(&Signature::of(sql)));
        let a = session.get_query(sql);
        let b = session.get_query(sql);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(session.has_query(&Signature::of(sql)));
        assert_eq!(driver.state().connects, 0);
    }

    #[test]
    fn test_case_and_whitespace_are_significant() {
        let (mut session, _, _) = session();
        let a = session.get_query("SELECT 1");
        let b = session.get_query("select 1");
        let c = session.get_query("SELECT  1");

        assert_ne!(a.name(), b.name());
        assert_ne!(a.name(), c.name());
        assert_ne!(b.name(), c.name());
    }

    #[test]
    fn test_query_round_trips_parameter() {
        let (mut session, driver, _) = session();
        let result = session.query("SELECT $1::int", &[5.into()]).unwrap();

        assert_eq!(result.get(0, 0), Some(&Value::Int4(5)));
        assert_eq!(
            driver.state().prepares,
            vec![(1, "__ps_0".to_string(), vec![Oid::INT4])]
        );
    }

    #[test]
    fn test_bind_must_match_prepared_types() {
        let (mut session, _, _) = session();
        let handle = session.handle().unwrap();
        handle.prepare("typed", "SELECT $1::int8", &[Oid::INT4]).unwrap();

        assert!(handle.execute_prepared("typed", &[Value::Null]).is_ok());
        let err = handle.execute_prepared("typed", &[Value::Int8(2)]).unwrap_err();
        assert!(matches!(err, DriverError::Server(ref e) if e.code == "22P03"));
    }

    #[test]
    fn test_cached_statement_accepts_other_value_types() {
        let (mut session, driver, sink) = session();
        let sql = "SELECT $1::int8";

        session.query(sql, &[Value::Int4(1)]).unwrap();
        let result = session.query(sql, &[Value::Int8(2)]).unwrap();
        assert_eq!(result.get(0, 0), Some(&Value::Int8(2)));

        // NULL and the first types reuse what is already prepared
        session.query(sql, &[Value::Null]).unwrap();
        session.query(sql, &[Value::Int4(3)]).unwrap();
        assert_eq!(
            driver.state().prepares,
            vec![
                (1, "__ps_0".to_string(), vec![Oid::INT4]),
                (1, "__ps_0_1".to_string(), vec![Oid::INT8]),
            ]
        );
        assert!(sink.levels().is_empty());
    }

    #[test]
    fn test_null_first_then_typed_value() {
        let (mut session, driver, _) = session();
        session.query("SELECT $1", &[Value::Null]).unwrap();
        let result = session.query("SELECT $1", &[Value::Int4(7)]).unwrap();

        assert_eq!(result.get(0, 0), Some(&Value::Int4(7)));
        let types: Vec<Vec<Oid>> = driver.state().prepares.iter().map(|(_, _, t)| t.clone()).collect();
        assert_eq!(types, vec![vec![Oid::UNSPECIFIED], vec![Oid::INT4]]);
    }

    #[test]
    fn test_statement_prepared_once_per_handle() {
        let (mut session, driver, _) = session();
        session.query("SELECT $1::int", &[1.into()]).unwrap();
        session.query("SELECT $1::int", &[2.into()]).unwrap();
        assert_eq!(driver.state().prepares.len(), 1);

        session.reconnect().unwrap();
        let result = session.query("SELECT $1::int", &[3.into()]).unwrap();

        assert_eq!(result.get(0, 0), Some(&Value::Int4(3)));
        let handles: Vec<usize> = driver.state().prepares.iter().map(|(h, _, _)| *h).collect();
        assert_eq!(handles, vec![1, 2]);
    }

    #[test]
    fn test_uncached_statement() {
        let (mut session, _, _) = session();
        let cached = session.get_query("SELECT $1::text");
        let loose = session.create_prepared_query("SELECT $1::text");

        assert_ne!(cached.name(), loose.name());
        let result = loose.execute(&mut session, &["hello".into()]).unwrap();
        assert_eq!(result.get(0, 0).and_then(Value::as_str), Some("hello"));
    }

    #[test]
    fn test_query_failure_is_logged() {
        let (mut session, driver, sink) = session();
        driver.state().fail_on = Some("broken".to_string());

        let err = session.query("SELECT broken", &[]).unwrap_err();
        assert!(matches!(err, ConnectionError::QueryExecution { ref sql, .. } if sql == "SELECT broken"));
        assert_eq!(sink.levels(), vec![Level::Error]);
        // a later attempt prepares again
        driver.state().fail_on = None;
        session.query("SELECT broken", &[]).unwrap();
    }
}

// ============================================================================
// Anonymous execution
// ============================================================================

mod anonymous {
    use super::*;

    #[test]
    fn test_notice_logged_with_sql() {
        let (mut session, _, sink) = session();
        session.execute_anonymous_query("SELECT 1").unwrap();
        session
            .execute_parametrized_query("SELECT $1", &[Value::Null])
            .unwrap();

        let messages: Vec<String> = sink.records().into_iter().map(|(_, m, _)| m).collect();
        assert_eq!(
            messages,
            vec![
                "Anonymous query « SELECT 1 ».".to_string(),
                "Parametrized anonymous query « SELECT $1 ».".to_string(),
            ]
        );
        assert_eq!(sink.levels(), vec![Level::Notice, Level::Notice]);
    }

    #[test]
    fn test_failure_returned_not_logged() {
        let (mut session, driver, sink) = session();
        driver.state().fail_on = Some("oops".to_string());

        let err = session.execute_anonymous_query("SELECT oops").unwrap_err();
        assert!(matches!(err, ConnectionError::QueryExecution { .. }));
        let err = session.execute_parametrized_query("SELECT oops", &[]).unwrap_err();
        assert!(matches!(err, ConnectionError::QueryExecution { .. }));

        assert_eq!(sink.levels(), vec![Level::Notice, Level::Notice]);
    }

    #[test]
    fn test_last_statement_result_returned() {
        let (mut session, _, _) = session();
        let result = session.execute_anonymous_query("SELECT 1; SET x = 1").unwrap();
        assert_eq!(result.command_tag, "SET");

        let result = session.execute_anonymous_query("").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_parametrized_values() {
        let (mut session, _, _) = session();
        let result = session
            .execute_parametrized_query("SELECT $1, $2", &[Value::from(7i64), Value::from(Some("x"))])
            .unwrap();
        assert_eq!(result.get(0, 0).and_then(Value::as_i64), Some(7));
        assert_eq!(result.get(0, 1).and_then(Value::as_str), Some("x"));
    }
}

// ============================================================================
// Transactions
// ============================================================================

mod transactions {
    use super::*;

    #[test]
    fn test_begin_commit() {
        let (mut session, driver, _) = session();
        session.begin().unwrap();
        assert!(session.is_in_transaction().unwrap());
        session.commit().unwrap();
        assert!(!session.is_in_transaction().unwrap());

        assert_eq!(
            driver.state().executed,
            vec![
                "BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
                "COMMIT TRANSACTION".to_string(),
            ]
        );
    }

    #[test]
    fn test_begin_rollback() {
        let (mut session, driver, _) = session_with(config().isolation(IsolationLevel::Serializable));
        session.begin().unwrap();
        session.rollback(None).unwrap();

        assert!(!session.is_in_transaction().unwrap());
        assert_eq!(session.transaction_status().unwrap(), TransactionStatus::Idle);
        assert_eq!(
            driver.state().executed[0],
            "BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        );
        assert_eq!(driver.state().executed[1], "ROLLBACK TRANSACTION");
    }

    #[test]
    fn test_duplicate_savepoint_partial_rollback() {
        let (mut session, driver, _) = session();
        session.begin().unwrap();
        session.set_savepoint("a").unwrap();
        session.set_savepoint("a").unwrap();
        session.rollback(Some("a")).unwrap();

        assert!(session.is_in_transaction().unwrap());
        assert_eq!(
            session.transaction_status().unwrap(),
            TransactionStatus::InTransaction
        );
        assert_eq!(session.savepoints(), ["a", "a"]);
        assert_eq!(
            driver.state().executed.last().map(String::as_str),
            Some("ROLLBACK TO SAVEPOINT \"a\"")
        );
    }

    #[test]
    fn test_non_ascii_savepoint_names() {
        let (mut session, _, _) = session();
        session.begin().unwrap();
        // uppercasing changes the byte length of both names
        session.set_savepoint("kıyı").unwrap();
        session.set_savepoint("ſtraße").unwrap();
        session.rollback(Some("kıyı")).unwrap();

        assert_eq!(session.savepoints(), ["kıyı"]);
        session.release_savepoint("kıyı").unwrap();
        assert!(session.savepoints().is_empty());
        assert_eq!(
            session.transaction_status().unwrap(),
            TransactionStatus::InTransaction
        );
    }

    #[test]
    fn test_release_savepoint() {
        let (mut session, driver, _) = session();
        session.begin().unwrap();
        session.set_savepoint("outer").unwrap();
        session.set_savepoint("inner").unwrap();
        session.release_savepoint("outer").unwrap();

        assert!(session.savepoints().is_empty());
        assert!(session.is_in_transaction().unwrap());
        assert_eq!(
            driver.state().executed.last().map(String::as_str),
            Some("RELEASE SAVEPOINT \"outer\"")
        );
    }

    #[test]
    fn test_release_unknown_savepoint() {
        let (mut session, _, sink) = session();
        session.begin().unwrap();

        let err = session.release_savepoint("nope").unwrap_err();
        match &err {
            ConnectionError::TransactionControl {
                operation,
                isolation,
                sql,
                source,
            } => {
                assert_eq!(operation, &TransactionOp::ReleaseSavepoint("nope".to_string()));
                assert_eq!(*isolation, IsolationLevel::ReadCommitted);
                assert_eq!(sql, "RELEASE SAVEPOINT \"nope\"");
                assert!(matches!(source, DriverError::Server(e) if e.code == "3B001"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sink.levels().last(), Some(&Level::Error));

        // the failed transaction is reported, not masked
        assert_eq!(session.transaction_status().unwrap(), TransactionStatus::InError);
        assert!(session.is_in_transaction().unwrap());
        session.rollback(None).unwrap();
        assert!(!session.is_in_transaction().unwrap());
    }

    #[test]
    fn test_savepoint_outside_transaction() {
        let (mut session, _, sink) = session();
        let err = session.set_savepoint("a").unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::TransactionControl { operation: TransactionOp::SetSavepoint(ref n), .. } if n == "a"
        ));
        assert!(session.savepoints().is_empty());
        assert_eq!(sink.levels().last(), Some(&Level::Error));
    }

    #[test]
    fn test_commit_failure() {
        let (mut session, driver, sink) = session();
        session.begin().unwrap();
        driver.state().fail_on = Some("COMMIT".to_string());

        let err = session.commit().unwrap_err();
        assert_eq!(err.to_string(), "Cannot commit transaction (isolation level 'READ COMMITTED')");
        let (level, _, context) = sink.records().pop().unwrap();
        assert_eq!(level, Level::Error);
        assert_eq!(context.get("sql"), Some(&json!("COMMIT TRANSACTION")));
        assert!(context.contains_key("error"));
    }

    #[test]
    fn test_status_reads_server_state() {
        let (mut session, _, _) = session();
        session.begin().unwrap();
        session
            .handle()
            .unwrap()
            .simple_query("ROLLBACK")
            .unwrap();

        // bypassing the session is still seen
        assert!(!session.is_in_transaction().unwrap());
    }
}

// ============================================================================
// Escaping and notifications
// ============================================================================

mod escaping {
    use super::*;

    #[test]
    fn test_fallback_escaping() {
        let (mut session, _, _) = session();
        assert_eq!(session.escape_identifier("a\"b").unwrap(), "\"a\"\"b\"");
        assert_eq!(session.escape_literal("a'b").unwrap(), "'a''b'");
        assert_eq!(session.escape_literal("c:\\tmp").unwrap(), "'c:\\tmp'");
    }

    #[test]
    fn test_handle_escaping_preferred() {
        let (mut session, driver, _) = session();
        driver.state().rich_escaping = true;

        assert_eq!(session.escape_identifier("a\"b").unwrap(), "\"a\"\"b\"");
        assert_eq!(session.escape_literal("a'b").unwrap(), "'a''b'");
        assert_eq!(session.escape_literal("c:\\tmp").unwrap(), "E'c:\\\\tmp'");
    }

    #[test]
    fn test_notify() {
        let (mut session, driver, _) = session();
        session.notify("events", Some("it's done")).unwrap();
        session.notify("events", None).unwrap();
        session.notify("events", Some("")).unwrap();

        assert_eq!(
            driver.state().executed,
            vec![
                "NOTIFY \"events\", 'it''s done'".to_string(),
                "NOTIFY \"events\"".to_string(),
                "NOTIFY \"events\"".to_string(),
            ]
        );
    }

    #[test]
    fn test_notify_failure() {
        let (mut session, driver, sink) = session();
        driver.state().fail_on = Some("NOTIFY".to_string());

        let err = session.notify("events", Some("x")).unwrap_err();
        assert!(matches!(err, ConnectionError::Notification { ref channel, .. } if channel == "events"));
        assert_eq!(err.to_string(), "Could not notify 'events' event");
        assert_eq!(sink.levels(), vec![Level::Notice, Level::Error]);
    }
}

// ============================================================================
// Logging
// ============================================================================

mod logging {
    use super::*;

    #[test]
    fn test_session_injected_into_context() {
        let (session, _, sink) = session();
        let mut context = LogContext::new();
        context.insert("table".to_string(), json!("post"));
        session.log(Level::Info, "hello", context);

        let (_, _, context) = sink.records().pop().unwrap();
        assert_eq!(context.get("table"), Some(&json!("post")));
        let injected = context.get(SESSION_KEY).unwrap();
        assert_eq!(injected["id"], JsonValue::from(session.id().to_string()));
        assert_eq!(injected["target"], json!("user=app dbname=shop"));
    }

    #[test]
    fn test_caller_context_wins() {
        let (session, _, sink) = session();
        let mut context = LogContext::new();
        context.insert(SESSION_KEY.to_string(), json!("mine"));
        session.log(Level::Debug, "hello", context);

        let (_, _, context) = sink.records().pop().unwrap();
        assert_eq!(context.get(SESSION_KEY), Some(&json!("mine")));
    }

    #[test]
    fn test_no_sink_no_output() {
        let driver = MockDriver::new();
        let mut session = Session::builder(config()).driver(driver).build().unwrap();
        session.log(Level::Emergency, "nobody listens", LogContext::new());

        let sink = RecordingSink::new();
        session.set_logger(Some(sink.clone()));
        session.log(Level::Info, "now someone does", LogContext::new());
        assert_eq!(sink.records().len(), 1);
    }
}

// ============================================================================
// Maps and identity mapper
// ============================================================================

mod maps {
    use super::*;

    #[derive(Debug)]
    struct PostMap {
        session: uuid::Uuid,
        has_identity_mapper: bool,
    }

    #[derive(Debug)]
    struct CommentMap;

    fn factories() -> MapFactories {
        MapFactories::new()
            .register("Blog\\Post", |ctx: &MapContext| PostMap {
                session: ctx.session_id(),
                has_identity_mapper: ctx.identity_mapper().is_some(),
            })
            .register("Blog\\Comment", |_: &MapContext| CommentMap)
    }

    fn session_with_maps(config: SessionConfig) -> Session<MockDriver> {
        Session::builder(config)
            .driver(MockDriver::new())
            .maps(factories())
            .build()
            .unwrap()
    }

    #[test]
    fn test_map_cached_per_session() {
        let mut session = session_with_maps(config());
        let a = session.map_for::<PostMap>("\\Blog\\Post", false).unwrap();
        let b = session.map_for::<PostMap>("Blog\\Post", false).unwrap();
        let c = session.map_for::<PostMap>("Blog\\Post", true).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.session, session.id());
        assert!(!a.has_identity_mapper);

        let mut other = session_with_maps(config());
        let d = other.map_for::<PostMap>("Blog\\Post", false).unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn test_map_errors() {
        let mut session = session_with_maps(config());

        let err = session.map_for::<PostMap>("Blog\\Comment", false).unwrap_err();
        assert!(matches!(err, ConnectionError::MapTypeMismatch { ref entity, .. } if entity == "Blog\\Comment"));
        assert!(session.map_for::<CommentMap>("Blog\\Comment", false).is_ok());

        let err = session.get_map_for("Blog\\Tag", false).unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownEntity(ref e) if e == "Blog\\Tag"));
    }

    #[test]
    fn test_identity_mapper_from_config() {
        let mut session =
            session_with_maps(config().identity_mapper(IdentityMapperSetting::Default));
        assert!(session.identity_mapper().is_some());

        let map = session.map_for::<PostMap>("Blog\\Post", false).unwrap();
        assert!(map.has_identity_mapper);
    }

    #[test]
    fn test_named_identity_mapper() {
        let named = config().identity_mapper(IdentityMapperSetting::Named("Audit".to_string()));

        let err = Session::builder(named.clone())
            .driver(MockDriver::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Configuration(_)));

        let session = Session::builder(named)
            .driver(MockDriver::new())
            .identity_mappers(
                IdentityMappers::new().register("Audit", || Arc::new(SmartIdentityMapper::new())),
            )
            .build()
            .unwrap();
        assert!(session.identity_mapper().is_some());
    }

    #[test]
    fn test_injected_identity_mapper_wins() {
        let shared: Arc<dyn IdentityMapper> = Arc::new(SmartIdentityMapper::new());
        shared.store("PostMap", "1", Arc::new(1u8));

        let session = Session::builder(
            config().identity_mapper(IdentityMapperSetting::Named("Missing".to_string())),
        )
        .driver(MockDriver::new())
        .identity_mapper(Arc::clone(&shared))
        .build()
        .unwrap();

        let mapper = session.identity_mapper().unwrap();
        assert!(Arc::ptr_eq(mapper, &shared));
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let err = Session::builder(SessionConfig::new("", "shop"))
            .driver(MockDriver::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Configuration(_)));
    }
}
