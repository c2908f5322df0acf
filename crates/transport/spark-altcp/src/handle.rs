use std::fmt;

/// 连接句柄：竞技场槽位下标 + 代数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 回调可能在自身调用栈尚未展开时销毁连接；若回调拿到的是裸引用，就会悬垂。
///   句柄只是一个可复制的数字对，任何时候都能安全地拿去向 [`Stack`](crate::Stack) 查询“它还活着吗”。
///
/// ## 逻辑 (How)
/// - 槽位被释放时代数加一，因此旧句柄与复用同一槽位的新连接永远不会相等。
///
/// ## 契约 (What)
/// - 句柄失效后，所有基于它的操作都返回 [`TransportError::InvalidArgument`](crate::TransportError::InvalidArgument)
///   或中性值，不产生任何副作用。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}v{}", self.index, self.generation)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
