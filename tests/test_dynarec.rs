use dynarm::cpu::{Flag, GpReg};
use dynarm::dynarec::arm;
use dynarm::dynarec::link::dyna_linker;
use dynarm::dynarec::mem::HostCode;
use dynarm::flags::{self, DeferredOp};
use dynarm::{EmuContext, translate};

const PAGE: u32 = 0x0804_0000;

fn new_context() -> Box<EmuContext> {
    EmuContext::new(1).unwrap()
}

#[test]
fn test_translate_mov_ret() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);

    // mov eax, 5 ; ret
    let code = [0xB8, 0x05, 0x00, 0x00, 0x00, 0xC3];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();

    assert_eq!(PAGE, block.start());
    assert_eq!(PAGE + 6, block.end());
    assert_eq!(2, block.insts().len());
    assert_eq!(0, block.insts()[0].offset);
    assert_eq!(5, block.insts()[0].size);
    assert!(block.code_len() > 0);
    // Blocks never span a 64 KiB page.
    assert_eq!(block.start() >> 16, (block.end() - 1) >> 16);

    // First emitted word is the constant load into the EAX slot, r4.
    let words = unsafe {
        std::slice::from_raw_parts(block.entry() as *const u32, block.code_len() / 4)
    };
    assert_eq!(arm::movw(arm::xgpr(0), 5), words[0]);

    // Installed and discoverable, including mid-block addresses.
    assert_eq!(PAGE, ctx.block_at(PAGE).unwrap().start());
    assert_eq!(PAGE, ctx.block_at(PAGE + 3).unwrap().start());
    assert!(ctx.block_at(PAGE + 6).is_none());
    EmuContext::free(ctx);
}

#[test]
fn test_translate_needs_tracked_or_global() {
    let ctx = new_context();
    // Untracked page: the block lands in the global list, on isolated
    // memory that invalidation can unmap by itself.
    let code = [0x90, 0xC3];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();
    assert!(matches!(block.host(), HostCode::Isolated(_)));
    assert!(ctx.block_at(PAGE).is_some());
    assert!(!ctx.map.tracks(PAGE));

    ctx.clean_range(PAGE, 2);
    assert!(ctx.block_at(PAGE).is_none());
    EmuContext::free(ctx);
}

#[test]
fn test_invalidation_drops_lookup() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    let code = [0x40, 0xC3]; // inc eax ; ret
    translate(&ctx, &code, PAGE, PAGE).unwrap();
    assert!(ctx.block_at(PAGE).is_some());

    // One overlapping byte is enough.
    ctx.clean_range(PAGE + 1, 1);
    assert!(ctx.block_at(PAGE).is_none());
    // The page is still tracked; retranslation goes back to the pool.
    assert!(ctx.map.tracks(PAGE));
    let again = translate(&ctx, &code, PAGE, PAGE).unwrap();
    assert!(matches!(again.host(), HostCode::Pool { .. }));
    EmuContext::free(ctx);
}

#[test]
fn test_dead_flags_elided() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    // add eax, ebx ; add eax, ebx ; ret -- the first record is overwritten
    // before anything can read it.
    let code = [0x01, 0xD8, 0x01, 0xD8, 0xC3];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();
    let insts = block.insts();
    assert_eq!(3, insts.len());
    assert!(!insts[0].need_flags);
    assert!(insts[1].need_flags);
    EmuContext::free(ctx);
}

#[test]
fn test_jcc_consumes_flags() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    // cmp eax, ebx ; jz +2 ; nop ; nop ; ret
    let code = [0x39, 0xD8, 0x74, 0x02, 0x90, 0x90, 0xC3];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();
    let insts = block.insts();
    assert_eq!(5, insts.len());
    assert!(insts[0].defs_flags);
    assert!(insts[0].need_flags);
    assert!(insts[1].uses_flags);
    assert!(insts[1].barrier != 0);
    // The taken edge went through an indirection entry after the code.
    assert!(block.host().len() >= block.code_len() + 8);
    EmuContext::free(ctx);
}

#[test]
fn test_native_call_keeps_translating() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    let thunk = ctx.bridge.add(dynarm::context::guest_syscall as usize, 0);

    // call thunk ; ret
    let next = PAGE + 5;
    let rel = thunk.wrapping_sub(next);
    let mut code = vec![0xE8];
    code.extend_from_slice(&rel.to_le_bytes());
    code.push(0xC3);
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();
    // The call did not end the block; the ret is translated too.
    assert_eq!(2, block.insts().len());
    assert_eq!(PAGE + 6, block.end());
    EmuContext::free(ctx);
}

#[test]
fn test_untranslatable_first_instruction() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    // 0x0F 0x0B (UD2) has no handler.
    let code = [0x0F, 0x0B, 0x90];
    assert!(matches!(
        translate(&ctx, &code, PAGE, PAGE),
        Err(dynarm::Error::Untranslatable)
    ));
    EmuContext::free(ctx);
}

#[test]
fn test_block_ends_before_unhandled() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    // inc eax ; UD2: the block covers the inc and exits to the dispatcher.
    let code = [0x40, 0x0F, 0x0B];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();
    assert_eq!(2, block.insts().len());
    assert_eq!(2, block.insts()[1].barrier);
    EmuContext::free(ctx);
}

#[test]
fn test_linker_resolves_and_patches() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    let code = [0x90, 0xC3];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();

    let mut cpu = ctx.new_cpu();
    let mut entry = [0u32; 2];
    let target = dyna_linker(&mut *cpu, entry.as_mut_ptr(), PAGE);
    assert_eq!(block.entry() as u32, target);
    assert_eq!(target, entry[0]);
    assert_eq!(PAGE, cpu.ip);

    // Unknown targets fall back to the epilog stub.
    let fallback = dyna_linker(&mut *cpu, std::ptr::null_mut(), PAGE + 0x100);
    assert_eq!(ctx.stubs.epilog as u32, fallback);

    // A detached CPU cannot resolve anything.
    let mut loose = dynarm::CpuState::new();
    assert_eq!(0, dyna_linker(&mut loose, std::ptr::null_mut(), PAGE));
    EmuContext::free(ctx);
}

#[test]
fn test_deferred_sub_scenario() {
    let mut cpu = dynarm::CpuState::new();
    cpu.set_reg32(GpReg::Eax, 5);
    cpu.set_reg32(GpReg::Ebx, 3);
    let (a, b) = (cpu.reg32(GpReg::Eax), cpu.reg32(GpReg::Ebx));
    cpu.set_reg32(GpReg::Eax, a.wrapping_sub(b));
    cpu.set_deferred(DeferredOp::Sub32, a, b, a.wrapping_sub(b));
    assert_eq!(u32::from(DeferredOp::Sub32), cpu.df);
    flags::materialize(&mut cpu);
    assert!(!cpu.flag(Flag::Zf));

    cpu.set_reg32(GpReg::Eax, 3);
    cpu.set_reg32(GpReg::Ebx, 3);
    cpu.set_deferred(DeferredOp::Sub32, 3, 3, 0);
    flags::materialize(&mut cpu);
    assert!(cpu.flag(Flag::Zf));
    assert_eq!(u32::from(DeferredOp::None), cpu.df);
}

#[test]
fn test_fall_through_jump_is_followed() {
    let ctx = new_context();
    ctx.add_range(PAGE, 0x1000);
    // jmp +1 ; nop ; inc eax ; ret -- the short forward jump continues
    // translation at its target instead of ending the block.
    let code = [0xEB, 0x01, 0x90, 0x40, 0xC3];
    let block = translate(&ctx, &code, PAGE, PAGE).unwrap();
    assert_eq!(3, block.insts().len());
    assert_eq!(PAGE + 5, block.end());
    EmuContext::free(ctx);
}
