mod common;

use common::{assert_silent, recv, Harness};

use opcua_edge_adapter::opcua::types::{
    BrowseDescription, BrowseResult, ByteString, DataValue, ExpandedNodeId, Identifier,
    LocalizedText, NodeClass, NodeId, QualifiedName, ReferenceDescription, ReferenceTypeId,
    StatusCode, UAString, Variant,
};
use opcua_edge_adapter::{
    AdapterError, BrowseParameter, Command, ContinuationPoint, EdgeBrowseDirection, EdgeNodeClass,
    EdgeNodeId, NodeRequest, RequestMessage, ResponseKind,
};

const ENDPOINT: &str = "opc.tcp://factory.local:4840";

fn reference(ns: u16, id: &str, browse_name: &str, node_class: NodeClass) -> ReferenceDescription {
    ReferenceDescription {
        reference_type_id: ReferenceTypeId::Organizes.into(),
        is_forward: true,
        node_id: ExpandedNodeId {
            node_id: NodeId::new(ns, id),
            namespace_uri: UAString::null(),
            server_index: 0,
        },
        browse_name: QualifiedName {
            namespace_index: ns,
            name: browse_name.into(),
        },
        display_name: LocalizedText::from(browse_name),
        node_class,
        type_definition: ExpandedNodeId {
            node_id: NodeId::new(0, 58u32),
            namespace_uri: UAString::null(),
            server_index: 0,
        },
    }
}

fn result_with(references: Vec<ReferenceDescription>) -> BrowseResult {
    BrowseResult {
        status_code: StatusCode::Good,
        continuation_point: ByteString::null(),
        references: Some(references),
    }
}

fn string_id(description: &BrowseDescription) -> String {
    match &description.node_id.identifier {
        Identifier::String(s) => s.as_ref().to_string(),
        other => format!("{:?}", other),
    }
}

fn browse_request(name: &str) -> RequestMessage {
    RequestMessage::new(
        ENDPOINT,
        Command::Browse,
        vec![NodeRequest::read(EdgeNodeId::string(2, name)).with_alias(name)],
    )
}

#[tokio::test]
async fn test_browse_cycle_is_cut_by_browse_name() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "A" => result_with(vec![reference(2, "B", "B", NodeClass::Object)]),
                "B" => result_with(vec![reference(2, "A", "A", NodeClass::Object)]),
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("A"))
        .await
        .expect("browse");

    let msg = recv(&h.browses).await;
    assert_eq!(msg.kind, ResponseKind::BrowseResponse);
    assert_eq!(msg.browse_records.len(), 1);
    let record = &msg.browse_records[0];
    assert_eq!(record.browse_name, "B");
    assert_eq!(record.browse_path, "/A/B");
    assert_eq!(record.node, EdgeNodeId::string(2, "B"));

    // B's back-reference to A must not produce a response or recursion.
    assert_silent(&h.browses).await;
    assert_silent(&h.errors).await;
}

#[tokio::test]
async fn test_browse_cycle_cut_when_alias_differs_from_browse_name() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    // The server knows the start node as "A"; the caller aliases it freely.
    h.session
        .read_results
        .lock()
        .expect("script lock")
        .push_back(Ok(vec![DataValue {
            value: Some(Variant::from(QualifiedName {
                namespace_index: 2,
                name: "A".into(),
            })),
            status: None,
            ..Default::default()
        }]));

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "A" => result_with(vec![reference(2, "B", "B", NodeClass::Object)]),
                "B" => result_with(vec![reference(2, "A", "A", NodeClass::Object)]),
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    let msg = RequestMessage::new(
        ENDPOINT,
        Command::Browse,
        vec![NodeRequest::read(EdgeNodeId::string(2, "A")).with_alias("MyAlias")],
    );
    h.adapter.browse_node(msg).await.expect("browse");

    let msg = recv(&h.browses).await;
    assert_eq!(msg.browse_records.len(), 1);
    assert_eq!(msg.browse_records[0].browse_name, "B");
    // Paths render the server-side name, not the caller's alias.
    assert_eq!(msg.browse_records[0].browse_path, "/A/B");

    // B's back-reference must be cut on first sight: no duplicate response,
    // no third round trip into A.
    assert_silent(&h.browses).await;
    assert_eq!(
        h.session
            .recorded_calls()
            .iter()
            .filter(|c| c.as_str() == "browse")
            .count(),
        2
    );
}

#[tokio::test]
async fn test_browse_emits_value_alias_with_version_tag() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "Root" => {
                    let mut tagged = reference(2, "boiler.temp", "Temp", NodeClass::Variable);
                    tagged.display_name = LocalizedText::from("v=3 Temperature");
                    result_with(vec![tagged])
                }
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("Root"))
        .await
        .expect("browse");

    let msg = recv(&h.browses).await;
    let record = &msg.browse_records[0];
    assert_eq!(record.value_alias, "{2;S;v=3}Temp");
    assert_eq!(record.node_class, EdgeNodeClass::Variable);
}

#[tokio::test]
async fn test_browse_does_not_recurse_into_variables() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "Root" => result_with(vec![reference(2, "Speed", "Speed", NodeClass::Variable)]),
                other => panic!("unexpected browse of {:?}", other),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("Root"))
        .await
        .expect("browse");

    let msg = recv(&h.browses).await;
    assert_eq!(msg.browse_records[0].browse_name, "Speed");
    // One browse call only: the variable is a leaf.
    assert_eq!(
        h.session
            .recorded_calls()
            .iter()
            .filter(|c| c.as_str() == "browse")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_reference_validation_isolates_siblings() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "Root" => {
                    let mut remote = reference(2, "Remote", "Remote", NodeClass::Object);
                    remote.node_id.server_index = 1;
                    let mut unnamed = reference(2, "Unnamed", "", NodeClass::Object);
                    unnamed.browse_name = QualifiedName {
                        namespace_index: 2,
                        name: "".into(),
                    };
                    let mut untyped = reference(2, "Untyped", "Untyped", NodeClass::Variable);
                    untyped.type_definition = ExpandedNodeId {
                        node_id: NodeId::null(),
                        namespace_uri: UAString::null(),
                        server_index: 0,
                    };
                    result_with(vec![
                        remote,
                        unnamed,
                        untyped,
                        reference(2, "Valid", "Valid", NodeClass::Variable),
                    ])
                }
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("Root"))
        .await
        .expect("browse");

    // Three violations, each its own error, and the valid sibling survives.
    for _ in 0..3 {
        let error = recv(&h.errors).await;
        assert_eq!(error.kind, ResponseKind::Error);
    }
    let msg = recv(&h.browses).await;
    assert_eq!(msg.browse_records[0].browse_name, "Valid");
}

#[tokio::test]
async fn test_inverse_browse_rejects_forward_references() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "Root" => result_with(vec![reference(2, "B", "B", NodeClass::Object)]),
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    let msg = browse_request("Root").with_browse(BrowseParameter {
        direction: EdgeBrowseDirection::Inverse,
        ..Default::default()
    });
    h.adapter.browse_node(msg).await.expect("browse");

    let error = recv(&h.errors).await;
    assert!(error
        .error
        .expect("error detail")
        .reason
        .contains("forward reference"));
    assert_silent(&h.browses).await;
}

#[tokio::test]
async fn test_all_results_unknown_node_id() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|_| BrowseResult {
                status_code: StatusCode::BadNodeIdUnknown,
                continuation_point: ByteString::null(),
                references: None,
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("Missing"))
        .await
        .expect("browse");

    let error = recv(&h.errors).await;
    assert!(error
        .error
        .expect("error detail")
        .reason
        .contains("node id unknown for all browse results"));
    assert_silent(&h.browses).await;
}

#[tokio::test]
async fn test_browse_request_cap() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    let requests: Vec<NodeRequest> = (0..11)
        .map(|i| NodeRequest::read(EdgeNodeId::string(2, format!("N{}", i))))
        .collect();
    let result = h
        .adapter
        .browse_node(RequestMessage::new(ENDPOINT, Command::Browse, requests))
        .await;
    assert!(matches!(result, Err(AdapterError::TooManyBrowseTargets(11))));
    assert!(h.session.recorded_calls().is_empty());
}

#[tokio::test]
async fn test_continuation_point_round_trip() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    let cp_bytes = vec![0xABu8; 200];
    let script_cp = cp_bytes.clone();
    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(move |descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "A" => BrowseResult {
                    status_code: StatusCode::Good,
                    continuation_point: ByteString::from(script_cp.clone()),
                    references: Some(vec![reference(2, "C1", "C1", NodeClass::Variable)]),
                },
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("A"))
        .await
        .expect("browse");

    let first = recv(&h.browses).await;
    assert_eq!(first.browse_records[0].browse_name, "C1");

    let cp_msg = recv(&h.browses).await;
    assert_eq!(cp_msg.continuation_points.len(), 1);
    let point = &cp_msg.continuation_points[0];
    assert_eq!(point.continuation_point, cp_bytes);
    assert_eq!(point.browse_prefix, "A");
    assert!(!point.browse_prefix.starts_with('/'));

    // Resume from the delivered continuation point.
    h.session
        .browse_next_results
        .lock()
        .expect("script lock")
        .push_back(Ok(vec![result_with(vec![reference(
            2,
            "C2",
            "C2",
            NodeClass::Variable,
        )])]));

    let next = RequestMessage::new(ENDPOINT, Command::BrowseNext, Vec::new()).with_browse(
        BrowseParameter {
            continuation_points: vec![point.clone()],
            ..Default::default()
        },
    );
    h.adapter.browse_next(next).await.expect("browse next");

    let resumed = recv(&h.browses).await;
    assert_eq!(resumed.browse_records[0].browse_name, "C2");
    assert_eq!(resumed.browse_records[0].browse_path, "/A/C2");
    assert!(h
        .session
        .recorded_calls()
        .contains(&"browse_next".to_string()));
}

#[tokio::test]
async fn test_oversized_continuation_point_rejected() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|_| BrowseResult {
                status_code: StatusCode::Good,
                continuation_point: ByteString::from(vec![0u8; 1000]),
                references: Some(vec![reference(2, "X", "X", NodeClass::Variable)]),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("A"))
        .await
        .expect("browse");

    let error = recv(&h.errors).await;
    assert!(error
        .error
        .expect("error detail")
        .reason
        .contains("continuation point"));
    assert_silent(&h.browses).await;
}

#[tokio::test]
async fn test_continuation_point_without_references_rejected() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|_| BrowseResult {
                status_code: StatusCode::Good,
                continuation_point: ByteString::from(vec![1u8, 2, 3]),
                references: Some(Vec::new()),
            })
            .collect())
    }));

    h.adapter
        .browse_node(browse_request("A"))
        .await
        .expect("browse");

    let error = recv(&h.errors).await;
    assert!(error
        .error
        .expect("error detail")
        .reason
        .contains("no references"));
}

#[tokio::test]
async fn test_browse_views_accumulates_into_one_response() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        Ok(descriptions
            .iter()
            .map(|d| match string_id(d).as_str() {
                "Root" => result_with(vec![
                    reference(2, "V1", "V1", NodeClass::View),
                    reference(2, "Area", "Area", NodeClass::Object),
                ]),
                "Area" => result_with(vec![reference(2, "V2", "V2", NodeClass::View)]),
                _ => result_with(Vec::new()),
            })
            .collect())
    }));

    h.adapter
        .browse_views(RequestMessage::new(
            ENDPOINT,
            Command::BrowseView,
            vec![NodeRequest::read(EdgeNodeId::string(2, "Root")).with_alias("Root")],
        ))
        .await
        .expect("browse views");

    let msg = recv(&h.browses).await;
    let names: Vec<&str> = msg
        .browse_records
        .iter()
        .map(|r| r.browse_name.as_str())
        .collect();
    assert_eq!(names, vec!["V1", "V2"]);
    // Views arrive accumulated, never one-by-one.
    assert_silent(&h.browses).await;
}

#[tokio::test]
async fn test_browse_next_requires_continuation_points() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    let result = h
        .adapter
        .browse_next(RequestMessage::new(ENDPOINT, Command::BrowseNext, Vec::new()))
        .await;
    assert!(matches!(result, Err(AdapterError::EmptyRequest)));

    let _ = ContinuationPoint {
        node: EdgeNodeId::string(2, "A"),
        continuation_point: Vec::new(),
        browse_prefix: String::new(),
    };
}

#[tokio::test]
async fn test_browse_defaults_to_root_folder() {
    let h = Harness::new();
    h.adapter.connect_client(ENDPOINT).await.expect("connect");

    *h.session.browse_fn.lock().expect("script lock") = Some(Box::new(|descriptions| {
        assert_eq!(descriptions.len(), 1);
        match &descriptions[0].node_id.identifier {
            Identifier::Numeric(84) => {}
            other => panic!("expected the root folder, got {:?}", other),
        }
        assert_eq!(descriptions[0].node_id.namespace, 0);
        Ok(vec![result_with(Vec::new())])
    }));

    h.adapter
        .browse_node(RequestMessage::new(ENDPOINT, Command::Browse, Vec::new()))
        .await
        .expect("browse");
    assert!(h.session.recorded_calls().contains(&"browse".to_string()));
}
