use crate::proto::instance::IndexDefn;
use crate::proto::instance::IndexState;
use crate::proto::instance::Instance;
use crate::proto::topic::ErrorResponse;
use crate::FeedError;

fn instance(id: u64, bucket: &str, state: IndexState) -> Instance {
    Instance {
        instance_id: id,
        state: state as i32,
        definition: Some(IndexDefn {
            defn_id: id,
            bucket: bucket.to_string(),
            name: format!("idx-{id}"),
            sec_exprs: vec!["`city`".to_string()],
        }),
        endpoints: vec!["localhost:9104".to_string()],
    }
}

#[test]
fn instance_exposes_bucket_and_state() {
    let inst = instance(42, "b1", IndexState::Ready);
    assert_eq!(inst.bucket(), "b1");
    assert_eq!(inst.index_state(), IndexState::Ready);

    let bare = Instance::default();
    assert_eq!(bare.bucket(), "");
    assert_eq!(bare.index_state(), IndexState::Unspecified);
}

#[test]
fn error_response_round_trips_the_result() {
    assert!(ErrorResponse::ok().into_result().is_ok());

    let err = crate::Error::from(FeedError::InvalidBucket("b2".into()));
    let resp = ErrorResponse::failure(&err);
    let back = resp.into_result().unwrap_err();
    assert!(back.contains("feed.invalidBucket"));
}
