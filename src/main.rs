//! USB Mass Storage device exposing the flash partitions as files
//!
//! This firmware presents the on-chip flash partitions (bootloader, firmware,
//! settings, storage) as read-only files on a synthesized FAT32 volume, using
//! the SCSI transparent command set and Bulk-Only Transport.
//!
//! Target: STM32H743VIT6 (MicoAir H743 board)
//! USB: PA11 (DM) / PA12 (DP) -> USB2 (OTG2_HS)
//! Flash: 2 MiB internal, no external SPI NOR fitted

#![no_std]
#![no_main]

use core::mem::MaybeUninit;

use cortex_m_rt::entry;
use defmt::*;
use defmt_rtt as _;
use panic_probe as _;

use stm32h7xx_hal::rcc::rec::UsbClkSel;
use stm32h7xx_hal::usb_hs::{UsbBus, USB2};
use stm32h7xx_hal::{pac, prelude::*};

use usb_device::prelude::*;

use cu_flash_msc::directory::{build_directory, PartitionReader};
use cu_flash_msc::partition::{resolve_catalog, PartitionGeometry, PartitionId, CATALOG};
use cu_flash_msc::storage::mapped::MappedFlash;
use cu_flash_msc::storage::{Absent, Storage, StorageDevice};
use cu_flash_msc::{BotSession, Config, MscClass, Volume};

/// Internal flash window
const FLASH_BASE: usize = 0x0800_0000;
const FLASH_SIZE: u32 = 2 * 1024 * 1024;

const fn internal(start: u32, size: u32) -> PartitionGeometry {
    PartitionGeometry {
        device: StorageDevice::InternalFlash,
        start,
        size,
    }
}

/// Board partition layout, offsets relative to the flash base
static PARTITIONS: [(PartitionId, PartitionGeometry); 4] = [
    (PartitionId::Bootloader, internal(0x0000_0000, 0x0002_0000)),
    (PartitionId::Firmware, internal(0x0002_0000, 0x001A_0000)),
    (PartitionId::Settings, internal(0x001C_0000, 0x0002_0000)),
    (PartitionId::Storage, internal(0x001E_0000, 0x0002_0000)),
];

/// USB endpoint memory
static mut EP_MEMORY: MaybeUninit<[u32; 1024]> = MaybeUninit::uninit();

#[entry]
fn main() -> ! {
    info!("Flash partitions USB Mass Storage starting...");

    // Take peripherals
    let dp = pac::Peripherals::take().unwrap();

    // Configure power and clocks
    let pwr = dp.PWR.constrain();
    let vos = pwr.freeze();

    let rcc = dp.RCC.constrain();
    let mut ccdr = rcc
        .sys_ck(400.MHz())
        .pll1_q_ck(100.MHz())
        .freeze(vos, &dp.SYSCFG);

    // HSI48 is always enabled on H7, verify and configure for USB
    let _ = ccdr.clocks.hsi48_ck().expect("HSI48 must be running for USB");
    ccdr.peripheral.kernel_usb_clk_mux(UsbClkSel::Hsi48);
    info!("HSI48 clock configured for USB");

    // Configure GPIO ports
    let gpioa = dp.GPIOA.split(ccdr.peripheral.GPIOA);
    let gpioe = dp.GPIOE.split(ccdr.peripheral.GPIOE);

    // Configure status LED (PE6)
    let mut led = gpioe.pe6.into_push_pull_output();
    led.set_low();

    // Resolve the partitions present on this board and lay out the volume
    let partitions = unwrap!(resolve_catalog(&CATALOG, &PARTITIONS));
    let entries = unwrap!(build_directory::<MappedFlash, Absent>(&partitions));

    // SAFETY: the internal flash is mapped at FLASH_BASE and nothing erases or
    // programs it while this firmware runs.
    let flash = unsafe { MappedFlash::new(FLASH_BASE, FLASH_SIZE) };
    let reader = unwrap!(PartitionReader::new(Storage::new(flash, Absent), &partitions));

    let volume = unwrap!(Volume::new(reader, &entries)).label("COPPER");
    info!(
        "Volume: {} files, {} sectors",
        partitions.len(),
        volume.total_sectors()
    );

    let config = Config::new()
        .vendor("COPPER")
        .product("Flash Partitions")
        .revision("1.00");
    let session = BotSession::new(volume, config);

    // Configure USB2 pins (PA11 = DM, PA12 = DP) with Alternate<10>
    let usb_dm = gpioa.pa11.into_alternate::<10>();
    let usb_dp = gpioa.pa12.into_alternate::<10>();

    info!("Initializing USB2...");

    // Create USB2 peripheral (OTG2_HS with internal FS PHY)
    let usb = USB2::new(
        dp.OTG2_HS_GLOBAL,
        dp.OTG2_HS_DEVICE,
        dp.OTG2_HS_PWRCLK,
        usb_dm,
        usb_dp,
        ccdr.peripheral.USB2OTG,
        &ccdr.clocks,
    );

    // Initialize EP_MEMORY to zero
    let ep_mem = unsafe {
        let buf: &mut [MaybeUninit<u32>; 1024] =
            &mut *(core::ptr::addr_of_mut!(EP_MEMORY) as *mut _);
        for value in buf.iter_mut() {
            value.as_mut_ptr().write(0);
        }
        (*core::ptr::addr_of_mut!(EP_MEMORY)).assume_init_mut()
    };

    // Create USB bus
    let usb_bus = UsbBus::new(usb, ep_mem);

    // packet_size = 64 for FS
    let mut msc = MscClass::new(&usb_bus, 64, session).expect("Failed to create MSC class");

    // Create USB device
    let mut usb_dev = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0x1209, 0x0001))
        .strings(&[StringDescriptors::default()
            .manufacturer("Copper Project")
            .product("Flash Partitions")
            .serial_number("00000001")])
        .expect("Failed to set USB strings")
        .device_class(0x00)
        .max_packet_size_0(64)
        .expect("Invalid max_packet_size")
        .build();

    info!("USB Mass Storage device ready");
    led.set_high(); // LED on = ready

    let mut counter: u32 = 0;
    loop {
        usb_dev.poll(&mut [&mut msc]);

        // Blink LED periodically to show activity
        counter = counter.wrapping_add(1);
        if counter % 500_000 == 0 {
            led.toggle();
        }
    }
}
