//! Chunked firmware delivery on top of the command sequencer.

use std::time::Duration;

use log::{info, warn};
use tokio::spawn;
use tokio::sync::mpsc;

use crate::device::connection::{DeviceLink, UpgradeGuard};
use crate::device::types::{UpgradeEvent, UpgradeTarget};
use crate::protocol::{self, opcode};
use crate::protocol::params::{self, UPGRADE_CHUNK_SIZE};

pub(crate) fn spawn_upgrade(
    link: DeviceLink,
    sn: u32,
    image: Vec<u8>,
    target: UpgradeTarget,
    timeout: Duration,
    guard: UpgradeGuard,
) -> mpsc::Receiver<UpgradeEvent> {
    let (tx, rx) = mpsc::channel(64);
    spawn(run(link, sn, image, target, timeout, guard, tx));
    rx
}

async fn run(
    link: DeviceLink,
    sn: u32,
    image: Vec<u8>,
    target: UpgradeTarget,
    timeout: Duration,
    guard: UpgradeGuard,
    tx: mpsc::Sender<UpgradeEvent>,
) {
    // holds the connection's single session slot for the whole transfer
    let _guard = guard;

    let total = (image.len() + UPGRADE_CHUNK_SIZE - 1) / UPGRADE_CHUNK_SIZE;
    let crc = protocol::crc32(&image);
    info!(
        "Upgrading {:?} of {}: {} bytes in {} frames, crc 0x{:08X}",
        target, link.device.mac, image.len(), total, crc,
    );

    let prepare = params::encode_upgrade_prepare(sn, image.len() as u32, crc, total as u32, target.code());
    let prepared = link
        .request(opcode::PREPARE_UPGRADE, prepare, params::ACK_LEN, timeout)
        .await
        .and_then(|payload| params::decode_ack(&payload, "prepare upgrade"));
    if let Err(err) = prepared {
        finish(&link, &tx, false, format!("prepare failed: {}", err)).await;
        return;
    }

    for index in 0..total {
        let payload = params::encode_upgrade_frame(&image, index);
        let outcome = link
            .request(opcode::UPGRADE_DATA, payload, params::UPGRADE_FRAME_ACK_LEN, timeout)
            .await
            .and_then(|payload| params::decode_upgrade_frame_ack(&payload));

        match outcome {
            Ok(acked) if acked == index as u32 => {
                let _ = tx
                    .send(UpgradeEvent::FrameAcked {
                        index: index as u32,
                        total: total as u32,
                    })
                    .await;
            }
            Ok(acked) => {
                finish(
                    &link,
                    &tx,
                    false,
                    format!("frame {} acknowledged out of order (device reported {})", index, acked),
                )
                .await;
                return;
            }
            Err(err) => {
                // abort immediately, the remaining frames are never sent
                finish(&link, &tx, false, format!("frame {} failed: {}", index, err)).await;
                return;
            }
        }
    }

    finish(&link, &tx, true, format!("upgrade complete, {} frames transferred", total)).await;
}

async fn finish(link: &DeviceLink, tx: &mpsc::Sender<UpgradeEvent>, success: bool, message: String) {
    if success {
        info!("Upgrade of {}: {}", link.device.mac, message);
    } else {
        warn!("Upgrade of {}: {}", link.device.mac, message);
    }
    let _ = tx.send(UpgradeEvent::Result { success, message }).await;
}
