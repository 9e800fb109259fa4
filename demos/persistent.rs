// In demos/persistent.rs
//
// Shows the persistent-buffer round trip: create a named buffer, write a
// digest-stamped payload, detach it, re-open it by name and verify the
// contents survived. Finishes with the operator state dump.

use dmxp_bufferhub::Hub::producer::USE_CALLER;
use dmxp_bufferhub::Hub::BufferHubService;
use dmxp_bufferhub::Hub::Structs::Buffer_Structs::BufferDescription;
use sha2::{Digest, Sha256};

fn main() -> std::io::Result<()> {
    let hub = BufferHubService::new();
    let description = BufferDescription {
        width: 256,
        height: 256,
        format: 1,
        usage: 0,
        metadata_size: 32,
    };

    let producer = hub.create_persistent_buffer("demo_scratch", USE_CALLER, USE_CALLER, description)?;
    let first_id = producer.buffer_id();
    println!("Created persistent buffer \"demo_scratch\" as channel {}", first_id);

    let expected_digest = unsafe {
        let block = producer.block();
        let data = std::slice::from_raw_parts_mut(block.data_ptr(), block.data_size());
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i * 7) as u8;
        }
        Sha256::digest(&*data)
    };
    drop(producer);

    // Detach: the channel closes, the buffer parks under its name.
    hub.close_channel(first_id)?;
    println!("Detached channel {}", first_id);

    // Re-open from "another client" and verify the contents survived.
    let reopened = hub.get_persistent_buffer("demo_scratch", USE_CALLER, USE_CALLER)?;
    println!(
        "Re-attached \"demo_scratch\" as channel {} ({}x{})",
        reopened.buffer_id(),
        reopened.description().width,
        reopened.description().height
    );

    let digest = unsafe {
        let block = reopened.block();
        let data = std::slice::from_raw_parts(block.data_ptr(), block.data_size());
        Sha256::digest(data)
    };
    assert_eq!(expected_digest, digest, "contents changed across re-attach");
    println!("Contents verified across detach/re-attach");

    println!("\n{}", hub.dump_state());
    Ok(())
}
