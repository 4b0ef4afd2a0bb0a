//! `identify` - report who the connected device is.

use anyhow::Result;
use touchcomm::FirmwareMode;

use crate::commands::open_connection;

pub(crate) fn run(port: Option<&str>, baud: u32) -> Result<()> {
    let conn = open_connection(port, baud)?;
    let id = conn.identify()?;

    println!("part number:  {}", id.part_number);
    println!("build id:     {}", id.build_id);
    println!("mode:         {:?}", id.mode);
    println!("max write:    {}", id.max_write_size);

    match id.mode {
        FirmwareMode::Application => {
            let app = conn.get_app_info()?;
            println!("app version:  {}", app.version);
            println!("app status:   {:?}", app.status);
            println!(
                "config id:    {:02x?}",
                &app.customer_config_id[..4]
            );
            println!("sensor:       {}x{}", app.max_x, app.max_y);
            println!(
                "image:        {}x{}",
                app.num_of_image_rows, app.num_of_image_cols
            );
        }
        mode if mode.is_bootloader() => {
            let boot = conn.get_boot_info()?;
            println!("write block:  {} bytes", boot.write_block_size_bytes());
            println!("erase page:   {} bytes", boot.erase_page_size_bytes());
            println!("max payload:  {} bytes", boot.max_write_payload_size);
        }
        _ => {}
    }

    Ok(())
}
