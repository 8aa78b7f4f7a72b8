//! Dump network interfaces over a route netlink socket

use std::time::Duration;

use nlsock::{Action, CallbackKind, Completion, HeaderFlags, MessageType, Socket};

/// `RTM_GETLINK`
const GETLINK: MessageType = MessageType::Other(18);

/// Size of `struct ifinfomsg`
const IFINFOMSG_LEN: usize = 16;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut socket = Socket::connect(nlsock::NETLINK_ROUTE)?;
    socket.set_recv_timeout(Some(Duration::from_secs(2)));
    println!("bound to {}", socket.local());

    socket
        .callbacks_mut()
        .set_with_arg(CallbackKind::Valid, Vec::<i32>::new(), |envelope, _, links| {
            if let Ok(payload) = envelope.payload() {
                if let Some(index) = payload.get(4..8) {
                    let index = i32::from_ne_bytes([index[0], index[1], index[2], index[3]]);
                    links.push(index);
                }
            }
            Action::Proceed
        });

    let flags = HeaderFlags::new().with(HeaderFlags::DUMP);
    let seq = socket.send_simple(GETLINK, flags, &[0u8; IFINFOMSG_LEN])?;
    println!("sent dump request seq={seq}");

    loop {
        let outcome = socket.receive_and_dispatch()?;
        println!(
            "read {} messages ({} links), {:?}",
            outcome.received, outcome.delivered, outcome.completion
        );
        if outcome.completion != Completion::Drained {
            break;
        }
    }

    let links = socket
        .callbacks()
        .arg::<Vec<i32>>(CallbackKind::Valid)
        .cloned()
        .unwrap_or_default();
    println!("interface indices: {links:?}");

    let metrics = nlsock::metrics_snapshot();
    println!(
        "sent={} received={} acks={}",
        metrics.sent_messages, metrics.received_messages, metrics.acks
    );
    Ok(())
}
