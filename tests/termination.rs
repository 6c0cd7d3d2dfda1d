mod common;

use anyhow::Result;
use strum::IntoEnumIterator;

use isomdl_proximity::cbor;
use isomdl_proximity::definitions::SessionData;
use isomdl_proximity::presentation::harness::{
    run_matrix, run_scenario, EchoResponder, MediumKind, ScriptedReader, TerminationVariant,
    REQUEST,
};
use isomdl_proximity::presentation::reader::ReaderPresentment;
use isomdl_proximity::presentation::{Outcome, PresentmentConfig, Termination, TerminationMethod};
use isomdl_proximity::session::Status;
use isomdl_proximity::transport::{LoopbackMedium, Role, State};

use crate::common::{e_device_key_bytes, prepare_holder, raw_transport};

#[tokio::test]
async fn every_variant_over_every_medium() {
    let config = PresentmentConfig::default();
    for medium in MediumKind::iter() {
        for variant in TerminationVariant::iter() {
            let report = run_scenario(variant, medium, &config).await;
            assert!(report.succeeded(), "{variant} over {medium}: {report:?}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn matrix_statistics_count_every_attempt() {
    let statistics = run_matrix(
        2,
        &[MediumKind::BleL2cap, MediumKind::Nfc],
        &PresentmentConfig::default(),
    )
    .await;
    assert_eq!(statistics.attempts, 16);
    assert_eq!(statistics.successes, 16);
    assert_eq!(statistics.failures + statistics.timeouts + statistics.cancellations, 0);
}

/// Runs one holder and one reader, returning both outcomes and both handlers.
async fn converse(
    medium_kind: MediumKind,
    holder_config: PresentmentConfig,
    reader_config: PresentmentConfig,
    mut user: ScriptedReader,
) -> Result<(Outcome, EchoResponder, Outcome, ScriptedReader)> {
    let medium = LoopbackMedium::new();
    let holder = prepare_holder(&medium_kind.connection_method(), &medium, holder_config).await?;
    let reader = ReaderPresentment::from_qr_code(&holder.qr_code_uri(), medium, reader_config)?;
    let mut holder_state = holder.watch_state();
    let mut reader_state = reader.watch_state();

    let holder_task = tokio::spawn(async move {
        let mut responder = EchoResponder::default();
        let outcome = holder.run(&mut responder).await;
        (outcome, responder)
    });
    let reader_outcome = reader.run(REQUEST, &mut user).await;
    let (holder_outcome, responder) = holder_task.await?;

    assert_eq!(*holder_state.borrow_and_update(), State::Disconnected);
    assert_eq!(*reader_state.borrow_and_update(), State::Disconnected);
    Ok((holder_outcome, responder, reader_outcome, user))
}

#[tokio::test]
async fn follow_up_requests_share_one_session() -> Result<()> {
    let holder_config = PresentmentConfig {
        auto_close: false,
        ..PresentmentConfig::default()
    };
    let reader_config = PresentmentConfig {
        auto_close: false,
        termination: TerminationMethod::SeparateMessage,
        ..PresentmentConfig::default()
    };
    let user = ScriptedReader::new([b"second".to_vec()], true);

    let (holder, responder, reader, user) =
        converse(MediumKind::BlePeripheralServer, holder_config, reader_config, user).await?;

    assert_eq!(
        holder,
        Outcome::Completed {
            termination: Termination::PeerStatus,
            messages_sent: 2,
            messages_received: 3,
        }
    );
    assert_eq!(
        reader,
        Outcome::Completed {
            termination: Termination::Initiated(TerminationMethod::SeparateMessage),
            messages_sent: 3,
            messages_received: 2,
        }
    );
    assert_eq!(responder.requests, vec![REQUEST.to_vec(), b"second".to_vec()]);
    assert_eq!(
        user.responses,
        vec![
            [b"response to ".as_slice(), REQUEST].concat(),
            b"response to second".to_vec()
        ]
    );
    Ok(())
}

#[tokio::test]
async fn reader_ends_the_session_at_the_transport_level() -> Result<()> {
    let holder_config = PresentmentConfig {
        auto_close: false,
        ..PresentmentConfig::default()
    };
    let reader_config = PresentmentConfig {
        termination: TerminationMethod::TransportSpecific,
        ..PresentmentConfig::default()
    };

    let (holder, _, reader, _) = converse(
        MediumKind::WifiAware,
        holder_config,
        reader_config,
        ScriptedReader::default(),
    )
    .await?;

    assert_eq!(
        holder,
        Outcome::Completed {
            termination: Termination::PeerTransport,
            messages_sent: 1,
            messages_received: 1,
        }
    );
    assert_eq!(
        reader,
        Outcome::Completed {
            termination: Termination::Initiated(TerminationMethod::TransportSpecific),
            messages_sent: 1,
            messages_received: 1,
        }
    );
    Ok(())
}

#[tokio::test]
async fn declined_request_gets_an_empty_response() -> Result<()> {
    struct Declining;

    #[async_trait::async_trait]
    impl isomdl_proximity::presentation::RequestHandler for Declining {
        async fn on_request(&mut self, _request: Vec<u8>) -> Vec<u8> {
            vec![]
        }
    }

    let medium = LoopbackMedium::new();
    let holder = prepare_holder(
        &MediumKind::Nfc.connection_method(),
        &medium,
        PresentmentConfig::default(),
    )
    .await?;
    let reader = ReaderPresentment::from_qr_code(
        &holder.qr_code_uri(),
        medium,
        PresentmentConfig {
            auto_close: false,
            ..PresentmentConfig::default()
        },
    )?;
    let holder_task = tokio::spawn(async move {
        let mut handler = Declining;
        holder.run(&mut handler).await
    });
    let mut user = ScriptedReader::default();
    let reader_outcome = reader.run(REQUEST, &mut user).await;

    assert!(holder_task.await?.is_completed());
    assert!(reader_outcome.is_completed());
    assert_eq!(user.responses, vec![Vec::<u8>::new()]);
    Ok(())
}

#[tokio::test]
async fn undecodable_first_message_is_reported_to_the_reader() -> Result<()> {
    let medium = LoopbackMedium::new();
    let method = MediumKind::WifiAware.connection_method();
    let holder = prepare_holder(&method, &medium, PresentmentConfig::default()).await?;
    let e_device_key_bytes = e_device_key_bytes(&holder);
    let holder_task = tokio::spawn(async move {
        let mut responder = EchoResponder::default();
        holder.run(&mut responder).await
    });

    let mut reader = raw_transport(&method, Role::MdocReader, &medium);
    reader.open(&e_device_key_bytes).await?;
    reader.send_message(&[0x01, 0x02, 0x03]).await?;
    let reply: SessionData = cbor::from_slice(&reader.wait_for_message().await?)?;
    assert_eq!(reply.status, Some(Status::CborDecodingError));
    assert!(reply.data.is_none());

    assert!(matches!(holder_task.await?, Outcome::Failed(_)));
    reader.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_sides_closing_on_their_own_still_complete() -> Result<()> {
    let media = [
        MediumKind::BlePeripheralServer,
        MediumKind::Nfc,
        MediumKind::WifiAware,
    ];
    for method in TerminationMethod::iter() {
        for medium_kind in media {
            let holder_config = PresentmentConfig {
                termination: method,
                ..PresentmentConfig::default()
            };
            let (holder, _, reader, user) = converse(
                medium_kind,
                holder_config,
                PresentmentConfig::default(),
                ScriptedReader::default(),
            )
            .await?;

            // Either side may get its termination out first; both must see a completed session.
            assert!(holder.is_completed(), "{method} over {medium_kind}: {holder:?}");
            assert!(reader.is_completed(), "{method} over {medium_kind}: {reader:?}");
            assert_eq!(user.responses.len(), 1, "{method} over {medium_kind}");
        }
    }
    Ok(())
}
